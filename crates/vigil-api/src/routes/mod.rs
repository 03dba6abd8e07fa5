//! # API Route Modules
//!
//! - `policies`: policy, condition and action administration (Admin writes,
//!   Analyst reads).
//! - `events`: event submission and dry-run preview (Operator).
//! - `subjects`: effective policies per subject and resolution cache
//!   control.
//! - `executions`: execution record inspection and operator retry.
//! - `audit`: audit ledger queries and chain verification.

pub mod audit;
pub mod events;
pub mod executions;
pub mod policies;
pub mod subjects;

use vigil_core::PolicyId;

use crate::error::AppError;
use crate::state::AppState;

/// Write a policy change and its ledger entries through to the database.
///
/// Failure is surfaced to the client because the in-memory change would be
/// lost on restart.
pub(crate) async fn write_through(state: &AppState, policy_id: PolicyId) -> Result<(), AppError> {
    if let Err(e) = state.persist_policy(policy_id).await {
        tracing::error!(policy_id = %policy_id, error = %e, "failed to persist policy to database");
        return Err(AppError::Internal(
            "policy change recorded in-memory but database persist failed".to_string(),
        ));
    }
    flush_ledger(state).await
}

/// Persist pending ledger entries, surfacing failure as 500.
pub(crate) async fn flush_ledger(state: &AppState) -> Result<(), AppError> {
    if let Err(e) = state.flush_ledger().await {
        tracing::error!(error = %e, "failed to persist audit ledger entries");
        return Err(AppError::Internal(
            "audit entries recorded in-memory but database persist failed".to_string(),
        ));
    }
    Ok(())
}
