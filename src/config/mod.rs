//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Scheduler intervals can additionally be overridden from a TOML file
//! named by `PROCQ_CONFIG`.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub db_max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
}

/// Intervals of the periodic tasks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the wait watchdog scans suspended processes.
    pub watchdog_interval_secs: u64,
    /// How often unacknowledged commands are checked for redelivery.
    pub command_redelivery_interval_secs: u64,
    /// A sent command is redelivered when unacknowledged for this long.
    pub command_ack_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: 5,
            command_redelivery_interval_secs: 30,
            command_ack_timeout_secs: 120,
        }
    }
}

impl SchedulerConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn command_redelivery_interval(&self) -> Duration {
        Duration::from_secs(self.command_redelivery_interval_secs)
    }

    pub fn command_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.command_ack_timeout_secs)
    }

    /// Parse a `[scheduler]` table from TOML. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            scheduler: SchedulerConfig,
        }

        let file: File =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config file: {e}")))?;
        file.scheduler.validate()?;
        Ok(file.scheduler)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.watchdog_interval_secs == 0 || self.command_redelivery_interval_secs == 0 {
            return Err(Error::Config(
                "scheduler intervals must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let mut scheduler = match std::env::var("PROCQ_CONFIG").ok() {
            Some(path) => SchedulerConfig::load_file(Path::new(&path))?,
            None => SchedulerConfig::default(),
        };
        if let Some(secs) = parsed_var("PROCQ_WATCHDOG_INTERVAL_SECS")? {
            scheduler.watchdog_interval_secs = secs;
        }
        if let Some(secs) = parsed_var("PROCQ_COMMAND_REDELIVERY_SECS")? {
            scheduler.command_redelivery_interval_secs = secs;
        }
        if let Some(secs) = parsed_var("PROCQ_COMMAND_ACK_TIMEOUT_SECS")? {
            scheduler.command_ack_timeout_secs = secs;
        }
        scheduler.validate()?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            db_max_connections: parsed_var("PROCQ_DB_MAX_CONNECTIONS")?.unwrap_or(10),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            scheduler,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}
