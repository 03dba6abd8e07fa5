//! # Prometheus Metrics
//!
//! HTTP traffic is counted by [`metrics_middleware`] as requests pass
//! through. Engine state (policies, execution records by status, resolution
//! cache, audit ledger) is sampled into an [`EngineSnapshot`] on each
//! `/metrics` scrape and copied into gauges just before encoding.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// Latency buckets, in seconds.
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Engine state sampled at scrape time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    /// Policies in the store.
    pub policies: usize,
    /// Execution records per status name. `None` when the store could not
    /// be read; the previous values are then left in place.
    pub executions: Option<Vec<(String, u64)>>,
    /// Cached subject resolutions.
    pub cache_entries: usize,
    /// Cache hits since start.
    pub cache_hits: u64,
    /// Cache misses since start.
    pub cache_misses: u64,
    /// Cache entries dropped by invalidation.
    pub cache_invalidated: u64,
    /// Retained ledger entries.
    pub ledger_entries: usize,
    /// Whether the retained chain verifies.
    pub ledger_chain_valid: bool,
}

/// Shared metrics state backed by a Prometheus registry.
#[derive(Clone)]
pub struct ApiMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    http: HttpMetrics,
    engine: EngineGauges,
}

struct HttpMetrics {
    requests: IntCounterVec,
    latency: HistogramVec,
    errors: IntCounterVec,
}

struct EngineGauges {
    policies: Gauge,
    executions: GaugeVec,
    cache_entries: Gauge,
    cache_lookups: GaugeVec,
    cache_invalidations: Gauge,
    ledger_entries: Gauge,
    ledger_chain_valid: Gauge,
}

impl std::fmt::Debug for ApiMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiMetrics")
            .field("requests", &self.requests())
            .field("errors", &self.errors())
            .finish()
    }
}

/// Register `collector` and hand back a clone for recording.
fn register<C>(registry: &Registry, collector: C) -> prometheus::Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl ApiMetrics {
    /// Metrics on a fresh registry.
    ///
    /// # Panics
    ///
    /// Panics if a metric definition is rejected, which only happens when two
    /// share a name.
    pub fn new() -> Self {
        Self::try_new().expect("metric definitions are unique and well-formed")
    }

    /// Metrics on a fresh registry, reporting definition errors.
    pub fn try_new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http = HttpMetrics {
            requests: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("vigil_http_requests_total", "Total HTTP requests"),
                    &["method", "path", "status"],
                )?,
            )?,
            latency: register(
                &registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "vigil_http_request_duration_seconds",
                        "HTTP request duration in seconds",
                    )
                    .buckets(LATENCY_BUCKETS.to_vec()),
                    &["method", "path"],
                )?,
            )?,
            errors: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("vigil_http_errors_total", "HTTP responses with status >= 400"),
                    &["method", "path", "status"],
                )?,
            )?,
        };

        let engine = EngineGauges {
            policies: register(
                &registry,
                Gauge::new("vigil_policies_total", "Policies in the store")?,
            )?,
            executions: register(
                &registry,
                GaugeVec::new(
                    Opts::new("vigil_executions_total", "Execution records by status"),
                    &["status"],
                )?,
            )?,
            cache_entries: register(
                &registry,
                Gauge::new("vigil_resolution_cache_entries", "Cached subject resolutions")?,
            )?,
            cache_lookups: register(
                &registry,
                GaugeVec::new(
                    Opts::new(
                        "vigil_resolution_cache_lookups_total",
                        "Resolution cache lookups by result",
                    ),
                    &["result"],
                )?,
            )?,
            cache_invalidations: register(
                &registry,
                Gauge::new(
                    "vigil_resolution_cache_invalidations_total",
                    "Cache entries dropped by invalidation",
                )?,
            )?,
            ledger_entries: register(
                &registry,
                Gauge::new("vigil_ledger_entries_total", "Audit ledger entries retained")?,
            )?,
            ledger_chain_valid: register(
                &registry,
                Gauge::new(
                    "vigil_ledger_chain_valid",
                    "Whether the retained audit chain verifies (1=valid, 0=broken)",
                )?,
            )?,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                http,
                engine,
            }),
        })
    }

    /// Requests seen, across all labels.
    pub fn requests(&self) -> u64 {
        sum_counter(&self.inner.http.requests)
    }

    /// Error responses seen, across all labels.
    pub fn errors(&self) -> u64 {
        sum_counter(&self.inner.http.errors)
    }

    fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let label = status.to_string();
        let http = &self.inner.http;
        http.requests.with_label_values(&[method, path, &label]).inc();
        http.latency.with_label_values(&[method, path]).observe(duration_secs);
        if status >= 400 {
            http.errors.with_label_values(&[method, path, &label]).inc();
        }
    }

    /// Copy a sampled engine state into the gauges.
    pub fn observe(&self, snapshot: &EngineSnapshot) {
        let gauges = &self.inner.engine;
        gauges.policies.set(snapshot.policies as f64);
        if let Some(executions) = &snapshot.executions {
            gauges.executions.reset();
            for (status, count) in executions {
                gauges.executions.with_label_values(&[status.as_str()]).set(*count as f64);
            }
        }
        gauges.cache_entries.set(snapshot.cache_entries as f64);
        gauges.cache_lookups.with_label_values(&["hit"]).set(snapshot.cache_hits as f64);
        gauges.cache_lookups.with_label_values(&["miss"]).set(snapshot.cache_misses as f64);
        gauges.cache_invalidations.set(snapshot.cache_invalidated as f64);
        gauges.ledger_entries.set(snapshot.ledger_entries as f64);
        gauges
            .ledger_chain_valid
            .set(if snapshot.ledger_chain_valid { 1.0 } else { 0.0 });
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.inner.registry.gather(), &mut buffer)
            .map_err(|e| format!("failed to encode metrics: {e}"))?;
        String::from_utf8(buffer).map_err(|e| format!("metrics encoding produced invalid UTF-8: {e}"))
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn sum_counter(counter: &IntCounterVec) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

fn is_uuid(segment: &str) -> bool {
    segment.len() == 36
        && segment.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Collapse identifier segments to `{id}` to keep label cardinality bounded.
///
/// UUIDs are collapsed wherever they appear. Subject identifiers are free
/// form, so the segment after `subjects` is always collapsed.
fn normalize_path(path: &str) -> String {
    let mut previous = "";
    path.split('/')
        .map(|segment| {
            let collapsed = is_uuid(segment) || (previous == "subjects" && !segment.is_empty());
            previous = segment;
            if collapsed {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Record method, normalized path, status and latency of each request.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let metrics = request.extensions().get::<ApiMetrics>().cloned();
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());
    let start = Instant::now();

    let response = next.run(request).await;

    if let Some(metrics) = metrics {
        metrics.record_request(
            &method,
            &path,
            response.status().as_u16(),
            start.elapsed().as_secs_f64(),
        );
    }
    response
}
