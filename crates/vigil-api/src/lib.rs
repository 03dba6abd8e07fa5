//! # vigil-api: HTTP Service for the Vigil Policy Engine
//!
//! ## API Surface
//!
//! | Prefix | Module | Domain |
//! |---|---|---|
//! | `/v1/policies/*` | [`routes::policies`] | Policy administration |
//! | `/v1/events/*` | [`routes::events`] | Event evaluation |
//! | `/v1/subjects/*`, `/v1/cache/*` | [`routes::subjects`] | Resolution |
//! | `/v1/executions/*`, `/v1/stats/*` | [`routes::executions`] | Execution records |
//! | `/v1/audit/*` | [`routes::audit`] | Audit ledger |
//!
//! ## Middleware Stack (execution order)
//!
//! ```text
//! TraceLayer → MetricsMiddleware → AuthMiddleware → Handler
//! ```
//!
//! ## OpenAPI
//!
//! Generated via utoipa derive macros at `/openapi.json`.

pub mod auth;
pub mod db;
pub mod directory;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod openapi;
pub(crate) mod retry;
pub mod routes;
pub mod state;
pub mod webhook;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::IntoResponse;
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::middleware::metrics::{ApiMetrics, EngineSnapshot};
use crate::state::AppState;

/// Check if metrics are enabled via the `VIGIL_METRICS_ENABLED` env var.
/// Defaults to `true` when the variable is absent or set to anything other than `"false"`.
fn metrics_enabled() -> bool {
    std::env::var("VIGIL_METRICS_ENABLED")
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(true)
}

/// Assemble the full application router with all routes and middleware.
///
/// Health probes (`/health/*`) and `/metrics` are mounted outside the auth
/// middleware so they remain accessible without credentials.
pub fn app(state: AppState) -> Router {
    let auth_config = AuthConfig {
        token: state.config.auth_token.clone(),
    };
    let metrics = ApiMetrics::new();
    let metrics_on = metrics_enabled();

    // Body size limit: 2 MiB.
    let mut api = Router::new()
        .merge(routes::policies::router())
        .merge(routes::events::router())
        .merge(routes::subjects::router())
        .merge(routes::executions::router())
        .merge(routes::audit::router())
        .merge(openapi::router())
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(from_fn(auth::auth_middleware));

    if metrics_on {
        api = api
            .layer(from_fn(middleware::metrics::metrics_middleware))
            .layer(Extension(metrics.clone()));
    }

    let api = api
        .layer(TraceLayer::new_for_http())
        .layer(Extension(auth_config))
        .with_state(state.clone());

    let mut unauthenticated = Router::new()
        .route("/health/liveness", axum::routing::get(liveness))
        .route("/health/readiness", axum::routing::get(readiness));

    if metrics_on {
        unauthenticated = unauthenticated
            .route("/metrics", axum::routing::get(prometheus_metrics))
            .layer(Extension(metrics));
    }

    let unauthenticated = unauthenticated.with_state(state);

    Router::new().merge(unauthenticated).merge(api)
}

/// GET /metrics: Prometheus metrics scrape endpoint.
///
/// Samples the engine into the gauges, then encodes every metric in the
/// Prometheus text exposition format.
async fn prometheus_metrics(
    State(state): State<AppState>,
    Extension(metrics): Extension<ApiMetrics>,
) -> impl IntoResponse {
    let engine = &state.engine;
    let executions = match engine.executions().status_counts().await {
        Ok(counts) => Some(
            counts
                .into_iter()
                .map(|(status, count)| (status.as_str().to_string(), count))
                .collect(),
        ),
        Err(e) => {
            tracing::warn!("failed to read execution counts for metrics: {e}");
            None
        }
    };
    let cache = engine.cache().stats();
    let verification = engine.ledger().verify();
    metrics.observe(&EngineSnapshot {
        policies: engine.store().len(),
        executions,
        cache_entries: cache.entries,
        cache_hits: cache.hits,
        cache_misses: cache.misses,
        cache_invalidated: cache.invalidated,
        ledger_entries: verification.total_entries,
        ledger_chain_valid: verification.chain_valid,
    });

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode Prometheus metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}

/// Liveness probe: always returns 200 if the process is running.
async fn liveness() -> &'static str {
    "ok"
}

/// Readiness probe.
///
/// Checks that the execution store answers and, when configured, that the
/// database is reachable. Returns 200 "ready" or 503 with a diagnostic.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(pool) = &state.db_pool {
        if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
            tracing::warn!("Database health check failed: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "database unreachable").into_response();
        }
    }

    if let Err(e) = state.engine.executions().status_counts().await {
        tracing::warn!("Execution store health check failed: {e}");
        return (StatusCode::SERVICE_UNAVAILABLE, "execution store unavailable").into_response();
    }

    (StatusCode::OK, "ready").into_response()
}
