//! Error types for procq.

use thiserror::Error;

use crate::model::{ProcessKey, ProcessStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("process already exists: {0}")]
    DuplicateKey(ProcessKey),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
