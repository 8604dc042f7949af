//! Postgres connection pool, migrations, and health check.
//!
//! [`Db`] implements [`crate::store::QueueStore`] (see [`queue`]) and
//! [`crate::store::CommandStore`] (see [`commands`]) over one shared pool.

pub mod commands;
pub mod queue;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a unique violation to `on_conflict`, everything else to `Error::Database`.
pub(crate) fn map_unique_violation(e: sqlx::Error, on_conflict: impl FnOnce() -> Error) -> Error {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => on_conflict(),
        _ => Error::Database(e),
    }
}
