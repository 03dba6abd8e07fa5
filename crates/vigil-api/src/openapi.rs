//! # OpenAPI Specification Assembly
//!
//! Assembles all utoipa-documented routes into a single OpenAPI spec,
//! served at `/openapi.json`. Engine-owned types (policies, execution
//! records, ledger entries) are documented as free-form objects.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::state::AppState;

/// Adds the bearer token security scheme.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .description(Some(
                            "Bearer token `{role}:{principal}:{secret}` or `{secret}`. Secret set via AUTH_TOKEN.",
                        ))
                        .build(),
                ),
            );
        }
    }
}

/// Assembled OpenAPI spec for the entire API surface.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Vigil Policy Engine API",
        version = "0.1.0",
        description = "Insider-risk policy resolution and execution.\n\nProvides:\n- **Policy administration** with scoped policies, conditions and ordered actions\n- **Event evaluation** that resolves a subject's effective policies, filters them by condition and schedules actions\n- **Execution records** with operator retry of failed actions\n- **Audit ledger** of every mutation and execution transition, hash-chained\n\nAuthentication: Bearer token via `Authorization: Bearer <token>` header.\nAll `/v1/*` endpoints require authentication. Health probes (`/health/*`) and `/metrics` are unauthenticated."
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development server"),
    ),
    security(
        ("bearer_auth" = [])
    ),
    paths(
        // ── Policies ────────────────────────────────────────────────────
        crate::routes::policies::create_policy,
        crate::routes::policies::list_policies,
        crate::routes::policies::get_policy,
        crate::routes::policies::update_policy,
        crate::routes::policies::delete_policy,
        crate::routes::policies::add_condition,
        crate::routes::policies::remove_condition,
        crate::routes::policies::add_action,
        crate::routes::policies::update_action,
        crate::routes::policies::remove_action,
        // ── Events ──────────────────────────────────────────────────────
        crate::routes::events::submit_event,
        crate::routes::events::preview_event,
        // ── Subjects ────────────────────────────────────────────────────
        crate::routes::subjects::resolve_subject,
        crate::routes::subjects::invalidate_subject,
        crate::routes::subjects::cache_stats,
        // ── Executions ──────────────────────────────────────────────────
        crate::routes::executions::list_executions,
        crate::routes::executions::get_execution,
        crate::routes::executions::retry_execution,
        crate::routes::executions::execution_summary,
        // ── Audit ───────────────────────────────────────────────────────
        crate::routes::audit::query_ledger,
        crate::routes::audit::verify_ledger,
    ),
    components(
        schemas(
            crate::error::ErrorBody,
            crate::error::ErrorDetail,
            crate::auth::Role,
            crate::routes::events::PreviewResponse,
            crate::routes::subjects::PolicySummary,
            crate::routes::subjects::ResolutionResponse,
            crate::routes::subjects::InvalidationResponse,
            crate::routes::subjects::CacheStatsResponse,
            crate::routes::executions::ExecutionSummary,
            crate::routes::executions::RetryRequest,
            crate::routes::audit::VerifyResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "policies", description = "Policy, condition and action administration"),
        (name = "events", description = "Event evaluation"),
        (name = "subjects", description = "Policy resolution per subject"),
        (name = "executions", description = "Execution records and retry"),
        (name = "audit", description = "Audit ledger"),
    )
)]
pub struct ApiDoc;

/// Build the OpenAPI router.
pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_json))
}

/// GET /openapi.json: Return the generated OpenAPI specification.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
