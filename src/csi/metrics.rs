use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::error::FailureKind;

/// CSI metrics collector
pub struct CsiMetrics {
    /// Total CSI operations
    pub operations_total: CounterVec,
    /// CSI operation duration in seconds
    pub operation_duration: HistogramVec,
    /// CSI operation errors
    pub operation_errors: CounterVec,
    /// Publish failures by failure kind
    pub mount_failures: CounterVec,
    /// Unpublish calls that had to clean up without the helper
    pub forced_unpublish: IntCounter,
    /// Volumes known to this node, by phase
    pub volumes: GaugeVec,
}

impl CsiMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("gcsfuse_csi_operations_total", "Total CSI operations"),
            &["method"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "gcsfuse_csi_operation_duration_seconds",
                "CSI operation duration in seconds",
            ),
            &["method"],
        )?;

        let operation_errors = CounterVec::new(
            Opts::new("gcsfuse_csi_operation_errors_total", "CSI operation errors"),
            &["method"],
        )?;

        let mount_failures = CounterVec::new(
            Opts::new("gcsfuse_csi_mount_failures_total", "Publish failures by kind"),
            &["kind"],
        )?;

        let forced_unpublish = IntCounter::new(
            "gcsfuse_csi_forced_unpublish_total",
            "Unpublish calls completed by forced cleanup",
        )?;

        let volumes =
            GaugeVec::new(Opts::new("gcsfuse_csi_volumes", "Volumes on this node"), &["phase"])?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;
        registry.register(Box::new(mount_failures.clone()))?;
        registry.register(Box::new(forced_unpublish.clone()))?;
        registry.register(Box::new(volumes.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            operation_errors,
            mount_failures,
            forced_unpublish,
            volumes,
        })
    }

    /// Record an operation
    pub fn record_operation(&self, method: &str, duration_secs: f64, success: bool) {
        self.operations_total.with_label_values(&[method]).inc();
        self.operation_duration.with_label_values(&[method]).observe(duration_secs);
        if !success {
            self.operation_errors.with_label_values(&[method]).inc();
        }
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.mount_failures.with_label_values(&[kind.as_str()]).inc();
        if kind == FailureKind::UnpublishForced {
            self.forced_unpublish.inc();
        }
    }

    pub fn set_volumes(&self, phase: &str, count: usize) {
        self.volumes.with_label_values(&[phase]).set(count as f64);
    }
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// `GET /metrics` in the Prometheus text format.
pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(registry)
}
