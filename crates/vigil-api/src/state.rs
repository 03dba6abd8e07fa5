//! # Application State
//!
//! Shared state for the Axum application, passed to all route handlers
//! via the `State` extractor.
//!
//! ## Architecture
//!
//! AppState wraps one [`PolicyEngine`]. The engine's in-memory policy store
//! and ledger are authoritative while the process runs; when a database pool
//! is present they are written through after each mutation and reloaded on
//! startup, and execution records live in Postgres directly.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::PgPool;

use vigil_core::PolicyId;
use vigil_policy::{DirectoryLookup, EngineConfig, ExecutionStore, PolicyEngine, StaticDirectory, ValidationError};

use crate::db::executions::PgExecutionStore;

// -- Configuration ------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other} (expected text or json)")),
        }
    }
}

/// Application configuration.
///
/// Custom `Debug` redacts the `auth_token` to prevent credential leakage in logs.
#[derive(Clone)]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Static bearer token secret. If `None`, authentication is disabled.
    pub auth_token: Option<String>,
    /// Base URL of the HR/identity directory service.
    pub directory_url: Option<String>,
    /// Endpoint receiving action dispatches.
    pub webhook_url: Option<String>,
    /// Engine tunables.
    pub engine: EngineConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("directory_url", &self.directory_url)
            .field("webhook_url", &self.webhook_url)
            .field("engine", &self.engine)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: None,
            directory_url: None,
            webhook_url: None,
            engine: EngineConfig::default(),
            log_format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Build configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PORT` | 8080 |
    /// | `AUTH_TOKEN` | unset (auth disabled) |
    /// | `VIGIL_DIRECTORY_URL` | unset (empty static directory) |
    /// | `VIGIL_WEBHOOK_URL` | unset (dispatches are logged only) |
    /// | `VIGIL_EXECUTION_HORIZON_SECS` | 300 |
    /// | `VIGIL_POLL_INTERVAL_MS` | 1000 |
    /// | `VIGIL_MAX_CONCURRENT_QUEUES` | 16 |
    /// | `VIGIL_CLAIM_BATCH_SIZE` | 256 |
    /// | `VIGIL_CACHE_TTL_SECS` | 300 |
    /// | `VIGIL_DIRECTORY_TIMEOUT_MS` | 2000 |
    /// | `VIGIL_LEDGER_CAPACITY` | 0 (unbounded) |
    /// | `VIGIL_LOG_FORMAT` | text |
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = EngineConfig::default();
        let parse = |key: &str| -> Result<Option<u64>, String> {
            lookup(key)
                .map(|raw| raw.trim().parse::<u64>().map_err(|e| format!("{key}={raw:?}: {e}")))
                .transpose()
        };
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| format!("PORT={raw:?}: {e}"))?,
            None => 8080,
        };
        let engine = EngineConfig {
            execution_horizon_secs: parse("VIGIL_EXECUTION_HORIZON_SECS")?
                .unwrap_or(defaults.execution_horizon_secs),
            poll_interval_ms: parse("VIGIL_POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval_ms),
            max_concurrent_queues: parse("VIGIL_MAX_CONCURRENT_QUEUES")?
                .map_or(defaults.max_concurrent_queues, |v| v as usize),
            claim_batch_size: parse("VIGIL_CLAIM_BATCH_SIZE")?.map_or(defaults.claim_batch_size, |v| v as usize),
            cache_ttl_secs: parse("VIGIL_CACHE_TTL_SECS")?.unwrap_or(defaults.cache_ttl_secs),
            directory_timeout_ms: parse("VIGIL_DIRECTORY_TIMEOUT_MS")?.unwrap_or(defaults.directory_timeout_ms),
            ledger_capacity: parse("VIGIL_LEDGER_CAPACITY")?.map_or(defaults.ledger_capacity, |v| v as usize),
        };
        engine.validate().map_err(|e| e.to_string())?;

        Ok(Self {
            port,
            auth_token: non_empty("AUTH_TOKEN"),
            directory_url: non_empty("VIGIL_DIRECTORY_URL"),
            webhook_url: non_empty("VIGIL_WEBHOOK_URL"),
            engine,
            log_format: non_empty("VIGIL_LOG_FORMAT")
                .map(|v| v.parse::<LogFormat>())
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

// -- Application State --------------------------------------------------------

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The policy engine.
    pub engine: Arc<PolicyEngine>,
    /// Database pool, absent in in-memory mode.
    pub db_pool: Option<PgPool>,
    /// Highest ledger sequence known to be persisted.
    ledger_flushed: Arc<AtomicU64>,
    /// Configuration.
    pub config: AppConfig,
}

impl AppState {
    /// In-memory state with default configuration and an empty directory.
    ///
    /// # Panics
    ///
    /// Panics if the default engine configuration is rejected, which would be
    /// a programming error.
    pub fn new() -> Self {
        Self::try_with_config(AppConfig::default(), Arc::new(StaticDirectory::new()), None)
            .expect("default engine configuration is valid")
    }

    /// Build state over the given directory and optional database pool.
    ///
    /// With a pool, execution records are stored in Postgres.
    pub fn try_with_config(
        config: AppConfig,
        directory: Arc<dyn DirectoryLookup>,
        db_pool: Option<PgPool>,
    ) -> Result<Self, ValidationError> {
        let engine = match &db_pool {
            Some(pool) => {
                let executions: Arc<dyn ExecutionStore> = Arc::new(PgExecutionStore::new(pool.clone()));
                PolicyEngine::new(config.engine.clone(), directory, executions)?
            }
            None => PolicyEngine::in_memory(config.engine.clone(), directory)?,
        };
        Ok(Self {
            engine: Arc::new(engine),
            db_pool,
            ledger_flushed: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    /// Hydrate the in-memory policy store and ledger from the database.
    ///
    /// Called once on startup when a database pool is available. Policies with
    /// persisted execution records are marked referenced so their scope stays
    /// locked.
    pub async fn hydrate_from_db(&self) -> Result<(), String> {
        let pool = match &self.db_pool {
            Some(pool) => pool,
            None => return Ok(()),
        };

        let policies = crate::db::policies::load_all(pool)
            .await
            .map_err(|e| format!("failed to load policies: {e}"))?;
        let policy_count = policies.len();
        self.engine.store().restore(policies);

        let entries = crate::db::ledger::load_all(pool)
            .await
            .map_err(|e| format!("failed to load ledger entries: {e}"))?;
        let entry_count = entries.len();
        self.engine.ledger().restore(entries);
        self.ledger_flushed
            .store(self.engine.ledger().last_sequence(), Ordering::SeqCst);

        let referenced = self
            .engine
            .hydrate_references()
            .await
            .map_err(|e| format!("failed to load policy references: {e}"))?;

        let verification = self.engine.ledger().verify();
        if !verification.chain_valid {
            tracing::error!(
                broken_links = ?verification.broken_links,
                "persisted audit ledger failed chain verification"
            );
        }

        tracing::info!(
            policies = policy_count,
            ledger_entries = entry_count,
            referenced_policies = referenced,
            "Hydrated in-memory stores from database"
        );
        Ok(())
    }

    /// Write the current state of one policy through to the database.
    ///
    /// Deletes the row when the policy no longer exists. No-op without a pool.
    pub async fn persist_policy(&self, id: PolicyId) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.db_pool else {
            return Ok(());
        };
        match self.engine.store().get(id) {
            Some(policy) => crate::db::policies::upsert(pool, &policy).await,
            None => crate::db::policies::delete(pool, id).await.map(|_| ()),
        }
    }

    /// Persist ledger entries appended since the last flush.
    ///
    /// Returns the number of entries written. No-op without a pool.
    pub async fn flush_ledger(&self) -> Result<usize, sqlx::Error> {
        let Some(pool) = &self.db_pool else {
            return Ok(0);
        };
        let flushed = self.ledger_flushed.load(Ordering::SeqCst);
        let pending = self.engine.ledger().since(flushed);
        let Some(last) = pending.last().map(|e| e.sequence) else {
            return Ok(0);
        };
        crate::db::ledger::append_entries(pool, &pending).await?;
        self.ledger_flushed.fetch_max(last, Ordering::SeqCst);
        Ok(pending.len())
    }

    /// Highest ledger sequence persisted so far.
    pub fn ledger_flushed(&self) -> u64 {
        self.ledger_flushed.load(Ordering::SeqCst)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_without_environment() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.auth_token.is_none());
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn config_reads_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PORT", "9090"),
            ("AUTH_TOKEN", "s3cret"),
            ("VIGIL_EXECUTION_HORIZON_SECS", "60"),
            ("VIGIL_CACHE_TTL_SECS", "10"),
            ("VIGIL_LOG_FORMAT", "json"),
            ("VIGIL_WEBHOOK_URL", "http://hooks.internal/dispatch"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.engine.execution_horizon_secs, 60);
        assert_eq!(config.engine.cache_ttl_secs, 10);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.webhook_url.is_some());
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[("VIGIL_POLL_INTERVAL_MS", "soon")])).unwrap_err();
        assert!(err.contains("VIGIL_POLL_INTERVAL_MS"));
    }

    #[test]
    fn zero_horizon_is_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("VIGIL_EXECUTION_HORIZON_SECS", "0")])).is_err());
    }

    #[test]
    fn empty_token_disables_auth() {
        let config = AppConfig::from_lookup(lookup(&[("AUTH_TOKEN", "  ")])).unwrap();
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let config = AppConfig {
            auth_token: Some("super-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn persistence_is_a_noop_without_database() {
        let state = AppState::new();
        assert_eq!(state.flush_ledger().await.unwrap(), 0);
        assert!(state.persist_policy(PolicyId::new()).await.is_ok());
        assert!(state.hydrate_from_db().await.is_ok());
    }
}
