//! # Execution Records API
//!
//! Inspection of scheduled, completed and skipped actions, and the
//! operator retry of failed ones. A retry creates a new pending record
//! linked to the original; the original is never modified.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use vigil_core::{EventId, ExecutionId, PolicyId, SubjectId};
use vigil_policy::journal::ExecutionFilter;
use vigil_policy::{ExecutionRecord, ExecutionStatus};

use crate::auth::{require_role, CallerIdentity, Role};
use crate::error::AppError;
use crate::routes::flush_ledger;
use crate::state::AppState;

/// Records returned when no limit is given.
const DEFAULT_LIMIT: usize = 100;
/// Largest accepted limit.
const MAX_LIMIT: usize = 1_000;

/// Query parameters for listing execution records.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ExecutionQuery {
    pub policy_id: Option<Uuid>,
    pub event_id: Option<String>,
    pub subject_id: Option<String>,
    /// `pending`, `success`, `failed` or `skipped`.
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ExecutionQuery {
    fn into_filter(self) -> Result<ExecutionFilter, AppError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(AppError::Validation(format!("limit must be between 1 and {MAX_LIMIT}")));
        }
        Ok(ExecutionFilter {
            policy_id: self.policy_id.map(PolicyId::from_uuid),
            event_id: self.event_id.map(EventId::new).transpose()?,
            subject_id: self.subject_id.map(SubjectId::new).transpose()?,
            status: self
                .status
                .map(|s| s.parse::<ExecutionStatus>())
                .transpose()
                .map_err(AppError::Validation)?,
            limit: Some(limit),
        })
    }
}

/// Record counts per status.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExecutionSummary {
    /// Count per status, every status present.
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
}

/// Retry request.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RetryRequest {
    /// Free-text reason recorded in the service log.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Build the executions router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/executions", get(list_executions))
        .route("/v1/executions/:id", get(get_execution))
        .route("/v1/executions/:id/retry", post(retry_execution))
        .route("/v1/stats/executions", get(execution_summary))
}

/// GET /v1/executions: List execution records.
#[utoipa::path(
    get,
    path = "/v1/executions",
    params(ExecutionQuery),
    responses(
        (status = 200, description = "Matching records ordered by due time", body = serde_json::Value),
        (status = 422, description = "Invalid filter", body = crate::error::ErrorBody),
    ),
    tag = "executions"
)]
async fn list_executions(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<Vec<ExecutionRecord>>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let filter = query.into_filter()?;
    let records = state.engine.executions().list(&filter).await?;
    Ok(Json(records))
}

/// GET /v1/executions/:id: Get one execution record.
#[utoipa::path(
    get,
    path = "/v1/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution record ID")),
    responses(
        (status = 200, description = "Record found", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "executions"
)]
async fn get_execution(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionRecord>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let record = state
        .engine
        .executions()
        .get(ExecutionId::from_uuid(id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;
    Ok(Json(record))
}

/// POST /v1/executions/:id/retry: Retry a failed execution.
#[utoipa::path(
    post,
    path = "/v1/executions/{id}/retry",
    params(("id" = Uuid, Path, description = "Failed execution record ID")),
    request_body = RetryRequest,
    responses(
        (status = 201, description = "Retry record scheduled", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
        (status = 409, description = "Record is not failed", body = crate::error::ErrorBody),
    ),
    tag = "executions"
)]
async fn retry_execution(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Option<Json<RetryRequest>>,
) -> Result<(StatusCode, Json<ExecutionRecord>), AppError> {
    require_role(&caller, Role::Operator)?;
    let reason = body.and_then(|Json(req)| req.reason);
    let actor = caller.actor();
    let retry = state.engine.retry(ExecutionId::from_uuid(id), &actor).await?;
    tracing::info!(
        execution_id = %retry.id,
        retry_of = %id,
        actor = %actor,
        reason = reason.as_deref().unwrap_or(""),
        "operator retry accepted"
    );
    flush_ledger(&state).await?;
    Ok((StatusCode::CREATED, Json(retry)))
}

/// GET /v1/stats/executions: Record counts per status.
#[utoipa::path(
    get,
    path = "/v1/stats/executions",
    responses(
        (status = 200, description = "Counts per status", body = ExecutionSummary),
    ),
    tag = "executions"
)]
async fn execution_summary(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<ExecutionSummary>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let counts = state.engine.executions().status_counts().await?;
    let total = counts.values().sum();
    Ok(Json(ExecutionSummary {
        counts: counts
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect(),
        total,
    }))
}
