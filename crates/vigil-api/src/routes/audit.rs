//! # Audit Ledger API
//!
//! Read-only access to the hash-chained ledger of policy mutations and
//! execution transitions, and on-demand chain verification.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use vigil_policy::ledger::{ChainVerification, LedgerQuery};
use vigil_policy::LedgerEntry;

use crate::auth::{require_role, CallerIdentity, Role};
use crate::error::AppError;
use crate::state::AppState;

/// Entries returned when no limit is given.
const DEFAULT_LIMIT: usize = 500;
/// Largest accepted limit.
const MAX_LIMIT: usize = 10_000;
/// Upper bound on persisted entries read by one verification.
const VERIFY_LIMIT: i64 = 1_000_000;

/// Chain verification result.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyResponse {
    /// Verification of the retained in-memory chain.
    #[schema(value_type = Object)]
    pub in_memory: ChainVerification,
    /// Verification of the persisted chain, when a database is configured.
    #[schema(value_type = Option<Object>)]
    pub persisted: Option<ChainVerification>,
    /// Highest sequence written to the database.
    pub flushed_sequence: u64,
}

/// Build the audit router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/audit", get(query_ledger))
        .route("/v1/audit/verify", get(verify_ledger))
}

/// GET /v1/audit: Query ledger entries by entity, time range or sequence.
#[utoipa::path(
    get,
    path = "/v1/audit",
    params(
        ("entity_id" = Option<String>, Query, description = "Entity id, or owning policy id"),
        ("from" = Option<String>, Query, description = "Inclusive lower bound (RFC 3339)"),
        ("to" = Option<String>, Query, description = "Exclusive upper bound (RFC 3339)"),
        ("after_sequence" = Option<u64>, Query, description = "Only entries after this sequence"),
        ("limit" = Option<usize>, Query, description = "Maximum entries"),
    ),
    responses(
        (status = 200, description = "Entries in sequence order", body = serde_json::Value),
    ),
    tag = "audit"
)]
async fn query_ledger(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(mut query): Query<LedgerQuery>,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(AppError::Validation(format!("limit must be between 1 and {MAX_LIMIT}")));
    }
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(AppError::Validation("from must not be after to".to_string()));
        }
    }
    query.limit = Some(limit);
    Ok(Json(state.engine.ledger().query(&query)))
}

/// GET /v1/audit/verify: Verify the ledger hash chain.
#[utoipa::path(
    get,
    path = "/v1/audit/verify",
    responses(
        (status = 200, description = "Verification result", body = VerifyResponse),
    ),
    tag = "audit"
)]
async fn verify_ledger(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<VerifyResponse>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let in_memory = state.engine.ledger().verify();
    let persisted = match &state.db_pool {
        Some(pool) => Some(
            crate::db::ledger::verify_chain_integrity(pool, VERIFY_LIMIT)
                .await
                .map_err(|e| AppError::Internal(format!("failed to read persisted ledger: {e}")))?,
        ),
        None => None,
    };
    if !in_memory.chain_valid || persisted.as_ref().is_some_and(|p| !p.chain_valid) {
        tracing::error!(
            in_memory_broken = ?in_memory.broken_links,
            persisted_broken = ?persisted.as_ref().map(|p| &p.broken_links),
            "audit ledger chain verification failed"
        );
    }
    Ok(Json(VerifyResponse {
        in_memory,
        persisted,
        flushed_sequence: state.ledger_flushed(),
    }))
}
