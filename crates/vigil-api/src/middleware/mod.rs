//! # Middleware Stack
//!
//! Tower middleware for the API layer:
//! - [`metrics`]: Prometheus request metrics and engine gauges.
//!
//! Request tracing uses `tower_http::trace::TraceLayer` directly; auth lives
//! in [`crate::auth`].

pub mod metrics;
