//! Secret handling utilities.
//!
//! Re-exports secrecy types and redacts credentials from connection strings
//! before they reach the logs.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Connection URL with the password replaced, safe to log.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}
