//! # Policy Administration API
//!
//! CRUD for policies and their conditions and actions. Every mutation is
//! recorded in the audit ledger under the caller's principal and
//! invalidates cached resolutions for the affected scope.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use uuid::Uuid;

use vigil_core::{ActionId, ConditionId, PolicyId};
use vigil_policy::model::{ActionDraft, ActionPatch, ConditionDraft, PolicyPatch};
use vigil_policy::{Action, Condition, Policy, PolicyDraft};

use crate::auth::{require_role, CallerIdentity, Role};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_validated_json};
use crate::routes::write_through;
use crate::state::AppState;

/// Build the policy router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/policies", get(list_policies).post(create_policy))
        .route(
            "/v1/policies/:id",
            get(get_policy).patch(update_policy).delete(delete_policy),
        )
        .route("/v1/policies/:id/conditions", post(add_condition))
        .route(
            "/v1/policies/:id/conditions/:condition_id",
            axum::routing::delete(remove_condition),
        )
        .route("/v1/policies/:id/actions", post(add_action))
        .route(
            "/v1/policies/:id/actions/:action_id",
            patch(update_action).delete(remove_action),
        )
}

/// POST /v1/policies: Create a policy with optional inline conditions and actions.
#[utoipa::path(
    post,
    path = "/v1/policies",
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Policy created", body = serde_json::Value),
        (status = 422, description = "Malformed policy", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn create_policy(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<PolicyDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<Policy>), AppError> {
    require_role(&caller, Role::Admin)?;
    let draft = extract_validated_json(body)?;
    let policy = state.engine.store().create_policy(draft, &caller.actor())?;
    write_through(&state, policy.id).await?;
    Ok((StatusCode::CREATED, Json((*policy).clone())))
}

/// GET /v1/policies: List all policies.
#[utoipa::path(
    get,
    path = "/v1/policies",
    responses(
        (status = 200, description = "All policies", body = serde_json::Value),
    ),
    tag = "policies"
)]
async fn list_policies(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<Policy>>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let policies = state
        .engine
        .store()
        .list()
        .into_iter()
        .map(|p| (*p).clone())
        .collect();
    Ok(Json(policies))
}

/// GET /v1/policies/:id: Get one policy.
#[utoipa::path(
    get,
    path = "/v1/policies/{id}",
    params(("id" = Uuid, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Policy found", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn get_policy(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Policy>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let policy = state
        .engine
        .store()
        .get(PolicyId::from_uuid(id))
        .ok_or_else(|| AppError::NotFound(format!("policy {id} not found")))?;
    Ok(Json((*policy).clone()))
}

/// PATCH /v1/policies/:id: Update name, description, scope, priority or active flag.
#[utoipa::path(
    patch,
    path = "/v1/policies/{id}",
    params(("id" = Uuid, Path, description = "Policy ID")),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Policy updated", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
        (status = 409, description = "Scope locked by execution records", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn update_policy(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<PolicyPatch>, JsonRejection>,
) -> Result<Json<Policy>, AppError> {
    require_role(&caller, Role::Admin)?;
    let patch = extract_json(body)?;
    let policy = state
        .engine
        .store()
        .update_policy(PolicyId::from_uuid(id), patch, &caller.actor())?;
    write_through(&state, policy.id).await?;
    Ok(Json((*policy).clone()))
}

/// DELETE /v1/policies/:id: Delete a policy with its conditions and actions.
///
/// Pending execution records of the policy are skipped when they come due.
#[utoipa::path(
    delete,
    path = "/v1/policies/{id}",
    params(("id" = Uuid, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Deleted policy as it was", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn delete_policy(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Policy>, AppError> {
    require_role(&caller, Role::Admin)?;
    let removed = state
        .engine
        .store()
        .delete_policy(PolicyId::from_uuid(id), &caller.actor())?;
    write_through(&state, removed.id).await?;
    Ok(Json((*removed).clone()))
}

/// POST /v1/policies/:id/conditions: Add a condition.
#[utoipa::path(
    post,
    path = "/v1/policies/{id}/conditions",
    params(("id" = Uuid, Path, description = "Policy ID")),
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Condition added", body = serde_json::Value),
        (status = 404, description = "Policy not found", body = crate::error::ErrorBody),
        (status = 422, description = "Malformed condition", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn add_condition(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<ConditionDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<Condition>), AppError> {
    require_role(&caller, Role::Admin)?;
    let draft = extract_json(body)?;
    let policy_id = PolicyId::from_uuid(id);
    let condition = state
        .engine
        .store()
        .add_condition(policy_id, draft, &caller.actor())?;
    write_through(&state, policy_id).await?;
    Ok((StatusCode::CREATED, Json(condition)))
}

/// DELETE /v1/policies/:id/conditions/:condition_id: Remove a condition.
#[utoipa::path(
    delete,
    path = "/v1/policies/{id}/conditions/{condition_id}",
    params(
        ("id" = Uuid, Path, description = "Policy ID"),
        ("condition_id" = Uuid, Path, description = "Condition ID"),
    ),
    responses(
        (status = 200, description = "Removed condition", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn remove_condition(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path((id, condition_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Condition>, AppError> {
    require_role(&caller, Role::Admin)?;
    let policy_id = PolicyId::from_uuid(id);
    let condition = state.engine.store().remove_condition(
        policy_id,
        ConditionId::from_uuid(condition_id),
        &caller.actor(),
    )?;
    write_through(&state, policy_id).await?;
    Ok(Json(condition))
}

/// POST /v1/policies/:id/actions: Add an action.
#[utoipa::path(
    post,
    path = "/v1/policies/{id}/actions",
    params(("id" = Uuid, Path, description = "Policy ID")),
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Action added", body = serde_json::Value),
        (status = 404, description = "Policy not found", body = crate::error::ErrorBody),
        (status = 422, description = "Malformed action", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn add_action(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<ActionDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<Action>), AppError> {
    require_role(&caller, Role::Admin)?;
    let draft = extract_json(body)?;
    let policy_id = PolicyId::from_uuid(id);
    let action = state
        .engine
        .store()
        .add_action(policy_id, draft, &caller.actor())?;
    write_through(&state, policy_id).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

/// PATCH /v1/policies/:id/actions/:action_id: Update an action.
///
/// Disabling an action makes its pending execution records skip.
#[utoipa::path(
    patch,
    path = "/v1/policies/{id}/actions/{action_id}",
    params(
        ("id" = Uuid, Path, description = "Policy ID"),
        ("action_id" = Uuid, Path, description = "Action ID"),
    ),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Action updated", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn update_action(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path((id, action_id)): Path<(Uuid, Uuid)>,
    body: Result<Json<ActionPatch>, JsonRejection>,
) -> Result<Json<Action>, AppError> {
    require_role(&caller, Role::Admin)?;
    let patch = extract_json(body)?;
    let policy_id = PolicyId::from_uuid(id);
    let action = state.engine.store().update_action(
        policy_id,
        ActionId::from_uuid(action_id),
        patch,
        &caller.actor(),
    )?;
    write_through(&state, policy_id).await?;
    Ok(Json(action))
}

/// DELETE /v1/policies/:id/actions/:action_id: Remove an action.
#[utoipa::path(
    delete,
    path = "/v1/policies/{id}/actions/{action_id}",
    params(
        ("id" = Uuid, Path, description = "Policy ID"),
        ("action_id" = Uuid, Path, description = "Action ID"),
    ),
    responses(
        (status = 200, description = "Removed action", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn remove_action(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path((id, action_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Action>, AppError> {
    require_role(&caller, Role::Admin)?;
    let policy_id = PolicyId::from_uuid(id);
    let action = state.engine.store().remove_action(
        policy_id,
        ActionId::from_uuid(action_id),
        &caller.actor(),
    )?;
    write_through(&state, policy_id).await?;
    Ok(Json(action))
}
