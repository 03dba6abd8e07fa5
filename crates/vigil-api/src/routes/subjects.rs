//! # Subject Resolution API
//!
//! Exposes the resolver: which policies currently apply to a subject and
//! why, plus manual cache control for directory changes the engine cannot
//! observe.

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use vigil_core::{PolicyId, SubjectId};
use vigil_policy::cache::CacheStats;
use vigil_policy::Policy;

use crate::auth::{require_role, CallerIdentity, Role};
use crate::error::AppError;
use crate::state::AppState;

/// Policy as listed in a resolution.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PolicySummary {
    #[schema(value_type = String)]
    pub id: PolicyId,
    pub name: String,
    /// Scope in `type[:target]` form.
    pub scope: String,
    pub priority: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Policy> for PolicySummary {
    fn from(policy: &Policy) -> Self {
        Self {
            id: policy.id,
            name: policy.name.clone(),
            scope: policy.scope.to_string(),
            priority: policy.priority,
            created_at: policy.created_at,
        }
    }
}

/// Effective policies for a subject.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResolutionResponse {
    pub subject_id: String,
    /// Directory attributes, absent when the lookup failed.
    #[schema(value_type = Option<Object>)]
    pub attributes: Option<vigil_policy::SubjectAttributes>,
    /// `cache`, `computed` or `fail_closed`.
    pub source: String,
    /// Policies in resolution order.
    pub policies: Vec<PolicySummary>,
}

/// Cache invalidation result.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InvalidationResponse {
    pub subject_id: String,
    /// Whether a cached entry existed.
    pub invalidated: bool,
}

/// Resolution cache counters.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CacheStatsResponse {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidated: u64,
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(stats: CacheStats) -> Self {
        Self {
            entries: stats.entries,
            hits: stats.hits,
            misses: stats.misses,
            invalidated: stats.invalidated,
        }
    }
}

/// Build the subjects router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/subjects/:subject_id/policies", get(resolve_subject))
        .route("/v1/subjects/:subject_id/cache", delete(invalidate_subject))
        .route("/v1/cache/stats", get(cache_stats))
}

fn parse_subject(raw: String) -> Result<SubjectId, AppError> {
    SubjectId::new(raw).map_err(AppError::from)
}

/// GET /v1/subjects/:subject_id/policies: Effective policies for a subject.
#[utoipa::path(
    get,
    path = "/v1/subjects/{subject_id}/policies",
    params(("subject_id" = String, Path, description = "Subject identifier")),
    responses(
        (status = 200, description = "Resolution", body = ResolutionResponse),
    ),
    tag = "subjects"
)]
async fn resolve_subject(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(subject_id): Path<String>,
) -> Result<Json<ResolutionResponse>, AppError> {
    require_role(&caller, Role::Analyst)?;
    let subject = parse_subject(subject_id)?;
    let resolution = state.engine.resolve(&subject).await;
    Ok(Json(ResolutionResponse {
        subject_id: subject.to_string(),
        attributes: resolution.attributes,
        source: resolution.source.to_string(),
        policies: resolution
            .policies
            .iter()
            .map(|p| PolicySummary::from(p.as_ref()))
            .collect(),
    }))
}

/// DELETE /v1/subjects/:subject_id/cache: Drop a subject's cached resolution.
#[utoipa::path(
    delete,
    path = "/v1/subjects/{subject_id}/cache",
    params(("subject_id" = String, Path, description = "Subject identifier")),
    responses(
        (status = 200, description = "Invalidated", body = InvalidationResponse),
    ),
    tag = "subjects"
)]
async fn invalidate_subject(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(subject_id): Path<String>,
) -> Result<Json<InvalidationResponse>, AppError> {
    require_role(&caller, Role::Operator)?;
    let subject = parse_subject(subject_id)?;
    let invalidated = state.engine.invalidate_subject(&subject);
    tracing::info!(subject = %subject, invalidated, actor = %caller.actor(), "subject cache invalidated");
    Ok(Json(InvalidationResponse {
        subject_id: subject.to_string(),
        invalidated,
    }))
}

/// GET /v1/cache/stats: Resolution cache counters.
#[utoipa::path(
    get,
    path = "/v1/cache/stats",
    responses(
        (status = 200, description = "Cache statistics", body = CacheStatsResponse),
    ),
    tag = "subjects"
)]
async fn cache_stats(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<CacheStatsResponse>, AppError> {
    require_role(&caller, Role::Analyst)?;
    Ok(Json(state.engine.cache().stats().into()))
}
