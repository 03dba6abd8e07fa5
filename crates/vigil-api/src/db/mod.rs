//! # Database Persistence Layer
//!
//! Postgres persistence via SQLx.
//!
//! The database is **optional**. When `DATABASE_URL` is set the service
//! persists policies, execution records and the audit ledger; when absent it
//! runs in-memory only (development and tests).
//!
//! - [`executions::PgExecutionStore`] is the durable execution store. The
//!   scheduler awaits its insert before acknowledging an evaluation.
//! - Policies are written through after each successful store mutation and
//!   reloaded on startup.
//! - Ledger entries are flushed after each mutation and periodically for
//!   executor transitions, then reloaded on startup so the chain continues.

pub mod executions;
pub mod ledger;
pub mod policies;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Initialize the database connection pool and run migrations.
///
/// Returns `None` if `DATABASE_URL` is not set (in-memory-only mode).
pub async fn init_pool() -> Result<Option<PgPool>, sqlx::Error> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            tracing::warn!(
                "DATABASE_URL not set; running in-memory only mode. \
                 Policies and execution records will not survive restarts."
            );
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(Some(pool))
}

/// Wrap a value decoding failure as a sqlx decode error.
pub(crate) fn decode_error(column: &str, message: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("column {column}: {message}"),
    )))
}
