//! # Event Evaluation API
//!
//! Security events enter here. Evaluation resolves the subject's effective
//! policies, filters them by their conditions and schedules the matched
//! actions. The response is returned once the execution records are
//! durable; dispatch happens later in the background executor.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use vigil_policy::{EvaluationOutcome, ExecutionRecord, SecurityEvent};

use crate::auth::{require_role, CallerIdentity, Role};
use crate::error::AppError;
use crate::extractors::extract_validated_json;
use crate::routes::flush_ledger;
use crate::routes::subjects::PolicySummary;
use crate::state::AppState;

/// Dry-run result of an evaluation.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PreviewResponse {
    /// Event evaluated.
    pub event_id: String,
    /// Subject evaluated.
    pub subject_id: String,
    /// `cache`, `computed` or `fail_closed`.
    pub resolution_source: String,
    /// Effective policies in resolution order.
    pub resolved: Vec<PolicySummary>,
    /// Policies whose conditions matched, in resolution order.
    #[schema(value_type = Vec<String>)]
    pub matched_policy_ids: Vec<vigil_core::PolicyId>,
    /// Execution records that would be scheduled.
    #[schema(value_type = Vec<Object>)]
    pub planned: Vec<ExecutionRecord>,
}

/// Build the events router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/events", post(submit_event))
        .route("/v1/events/preview", post(preview_event))
}

/// POST /v1/events: Evaluate an event and schedule matched actions.
#[utoipa::path(
    post,
    path = "/v1/events",
    request_body = serde_json::Value,
    responses(
        (status = 202, description = "Event evaluated; execution records scheduled", body = serde_json::Value),
        (status = 422, description = "Malformed event", body = crate::error::ErrorBody),
    ),
    tag = "events"
)]
async fn submit_event(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<SecurityEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<EvaluationOutcome>), AppError> {
    require_role(&caller, Role::Operator)?;
    let event = extract_validated_json(body)?;
    let outcome = state.engine.evaluate(&event.subject_id, &event).await?;
    if !outcome.created_execution_record_ids.is_empty() {
        flush_ledger(&state).await?;
    }
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// POST /v1/events/preview: Show what an event would trigger without scheduling.
#[utoipa::path(
    post,
    path = "/v1/events/preview",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Evaluation preview", body = PreviewResponse),
        (status = 422, description = "Malformed event", body = crate::error::ErrorBody),
    ),
    tag = "events"
)]
async fn preview_event(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<SecurityEvent>, JsonRejection>,
) -> Result<Json<PreviewResponse>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let event = extract_validated_json(body)?;
    let preview = state
        .engine
        .preview(&event.subject_id, &event, Utc::now())
        .await;

    Ok(Json(PreviewResponse {
        event_id: event.event_id.to_string(),
        subject_id: event.subject_id.to_string(),
        resolution_source: preview.resolution.source.to_string(),
        resolved: preview
            .resolution
            .policies
            .iter()
            .map(|p| PolicySummary::from(p.as_ref()))
            .collect(),
        matched_policy_ids: preview.matched_policy_ids,
        planned: preview.planned,
    }))
}
