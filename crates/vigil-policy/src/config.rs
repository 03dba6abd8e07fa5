//! # Engine Configuration
//!
//! Tunables for resolution caching, scheduling and the executor pool.
//! Defaults match a single-node deployment; the API binary overrides them
//! from `VIGIL_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Longest delay an action may declare (30 days).
pub const MAX_ACTION_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a single handler dispatch, in seconds.
    pub execution_horizon_secs: u64,
    /// How often the executor polls for due records, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of (policy, event) queues executing at once.
    pub max_concurrent_queues: usize,
    /// Maximum records claimed per poll.
    pub claim_batch_size: usize,
    /// Resolution cache entry time-to-live, in seconds.
    pub cache_ttl_secs: u64,
    /// Directory lookup bound, in milliseconds. Exceeding it fails closed.
    pub directory_timeout_ms: u64,
    /// In-memory ledger capacity; 0 keeps every entry.
    pub ledger_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_horizon_secs: 300,
            poll_interval_ms: 1_000,
            max_concurrent_queues: 16,
            claim_batch_size: 256,
            cache_ttl_secs: 300,
            directory_timeout_ms: 2_000,
            ledger_capacity: 0,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the executor cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.execution_horizon_secs == 0 {
            return Err(ValidationError::InvalidConfig(
                "execution_horizon_secs must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.max_concurrent_queues == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_concurrent_queues must be positive".into(),
            ));
        }
        if self.directory_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "directory_timeout_ms must be positive".into(),
            ));
        }
        if self.claim_batch_size == 0 {
            return Err(ValidationError::InvalidConfig(
                "claim_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Upper bound on a single handler dispatch.
    pub fn execution_horizon(&self) -> Duration {
        Duration::from_secs(self.execution_horizon_secs)
    }

    /// Executor polling period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Directory lookup bound.
    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    /// Resolution cache time-to-live.
    pub fn cache_ttl(&self) -> chrono::Duration {
        clamped_seconds(self.cache_ttl_secs)
    }

    /// Age after which a claimed but unfinished record is considered
    /// orphaned by a crashed executor.
    pub fn stale_claim_after(&self) -> chrono::Duration {
        clamped_seconds(self.execution_horizon_secs.saturating_mul(2))
    }
}

/// Convert seconds into a `chrono::Duration`, saturating at chrono's range.
pub(crate) fn clamped_seconds(secs: u64) -> chrono::Duration {
    let max = i64::MAX / 1_000;
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(max).min(max))
}
