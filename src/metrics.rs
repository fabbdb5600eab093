//! Prometheus metrics for the matching core.
//!
//! Initialize once at startup:
//! ```ignore
//! let metrics = switchyard::metrics::init()?;
//! ```
//!
//! Then start the metrics server:
//! ```ignore
//! switchyard::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Default histogram buckets for match latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics handle containing all instruments. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Producer side
    tasks_added: CounterVec,
    sync_matches: CounterVec,

    // Poller side
    polls: CounterVec,
    poll_latency: HistogramVec,

    // Query path
    query_tasks: CounterVec,

    // Lease / pipeline
    lease_requests: Counter,
    condition_failures: Counter,
    tasks_gced: Counter,
    forwarded: CounterVec,
    backlog_hint: GaugeVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a task accepted by add_task, labeled by how it was delivered.
    pub fn record_task_added(&self, task_list: &str, sync_matched: bool) {
        let outcome = if sync_matched { "sync" } else { "persisted" };
        self.tasks_added
            .with_label_values(&[task_list, outcome])
            .inc();
        if sync_matched {
            self.sync_matches.with_label_values(&[task_list]).inc();
        }
    }

    /// Record a poll result.
    pub fn record_poll(&self, task_list: &str, outcome: &str) {
        self.polls.with_label_values(&[task_list, outcome]).inc();
    }

    pub fn record_poll_latency(&self, task_list: &str, seconds: f64) {
        self.poll_latency
            .with_label_values(&[task_list])
            .observe(seconds);
    }

    pub fn record_query_task(&self, task_list: &str, outcome: &str) {
        self.query_tasks
            .with_label_values(&[task_list, outcome])
            .inc();
    }

    pub fn record_lease_request(&self) {
        self.lease_requests.inc();
    }

    pub fn record_condition_failure(&self) {
        self.condition_failures.inc();
    }

    pub fn record_gc_deleted(&self, count: u64) {
        self.tasks_gced.inc_by(count as f64);
    }

    pub fn record_forwarded(&self, task_list: &str, kind: &str) {
        self.forwarded.with_label_values(&[task_list, kind]).inc();
    }

    pub fn set_backlog_hint(&self, task_list: &str, hint: i64) {
        self.backlog_hint
            .with_label_values(&[task_list])
            .set(hint as f64);
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let tasks_added = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "switchyard_tasks_added_total",
                "Tasks accepted by add_task, labeled sync or persisted",
            ),
            &["task_list", "outcome"],
        )?,
    );

    let sync_matches = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "switchyard_sync_matches_total",
                "Tasks delivered producer-to-poller with no persistence write",
            ),
            &["task_list"],
        )?,
    );

    let polls = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "switchyard_polls_total",
                "Long polls, labeled by outcome (task, query, empty)",
            ),
            &["task_list", "outcome"],
        )?,
    );

    let poll_latency = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "switchyard_poll_latency_seconds",
                "Time a poll waited before returning",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["task_list"],
        )?,
    );

    let query_tasks = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "switchyard_query_tasks_total",
                "Query dispatches, labeled by outcome (answered, failed, timeout)",
            ),
            &["task_list", "outcome"],
        )?,
    );

    let lease_requests = register(
        &registry,
        Counter::new(
            "switchyard_lease_requests_total",
            "Range lease acquisitions and renewals",
        )?,
    );

    let condition_failures = register(
        &registry,
        Counter::new(
            "switchyard_condition_failures_total",
            "Writes rejected because the range lease was stolen",
        )?,
    );

    let tasks_gced = register(
        &registry,
        Counter::new(
            "switchyard_tasks_gced_total",
            "Acked task rows deleted from the store",
        )?,
    );

    let forwarded = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "switchyard_forwarded_total",
                "Tasks, polls and queries relayed to the parent partition",
            ),
            &["task_list", "kind"],
        )?,
    );

    let backlog_hint = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "switchyard_backlog_count_hint",
                "Delivered-but-unacked tasks per task list",
            ),
            &["task_list"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        tasks_added,
        sync_matches,
        polls,
        poll_latency,
        query_tasks,
        lease_requests,
        condition_failures,
        tasks_gced,
        forwarded,
        backlog_hint,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when shutdown signal is received.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
