//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels for metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the per-cluster phase gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

impl prometheus_client::encoding::EncodeLabelSet for PhaseLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,

    /// 1 for the phase each cluster is in, 0 for the phases it left
    pub cluster_phase: Family<PhaseLabels, Gauge>,
    pub cluster_instances_desired: Family<ReconcileLabels, Gauge>,
    pub cluster_instances_ready: Family<ReconcileLabels, Gauge>,
    /// Failovers started
    pub failovers_total: Family<ReconcileLabels, Counter>,
    /// Bootstrap jobs observed as failed
    pub failed_jobs_total: Family<ReconcileLabels, Counter>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn labels(namespace: &str, name: &str) -> ReconcileLabels {
    ReconcileLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_topology_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_topology_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "postgres_topology_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let cluster_phase = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "postgres_topology_cluster_phase",
            "Current phase of each PostgreSQL cluster",
            cluster_phase.clone(),
        );

        let cluster_instances_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "postgres_topology_cluster_instances_desired",
            "Desired number of instances for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "postgres_topology_cluster_instances_ready",
            "Number of ready instances for each cluster",
            cluster_instances_ready.clone(),
        );

        let failovers_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_topology_failovers",
            "Number of failovers started",
            failovers_total.clone(),
        );

        let failed_jobs_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_topology_failed_bootstrap_jobs",
            "Number of failed bootstrap jobs replaced",
            failed_jobs_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            cluster_phase,
            cluster_instances_desired,
            cluster_instances_ready,
            failovers_total,
            failed_jobs_total,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = labels(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&labels(namespace, name))
            .inc();
    }

    pub fn record_failover(&self, namespace: &str, name: &str) {
        self.failovers_total
            .get_or_create(&labels(namespace, name))
            .inc();
    }

    pub fn record_failed_jobs(&self, namespace: &str, name: &str, count: u32) {
        self.failed_jobs_total
            .get_or_create(&labels(namespace, name))
            .inc_by(u64::from(count));
    }

    /// Move a cluster's phase gauge from `previous` to `phase`
    pub fn set_cluster_phase(&self, namespace: &str, name: &str, previous: Option<&str>, phase: &str) {
        let gauge = |phase: &str| PhaseLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: phase.to_string(),
        };
        if let Some(previous) = previous.filter(|p| *p != phase) {
            self.cluster_phase.get_or_create(&gauge(previous)).set(0);
        }
        self.cluster_phase.get_or_create(&gauge(phase)).set(1);
    }

    /// Update cluster instance metrics
    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = labels(namespace, name);
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready
            .get_or_create(&labels)
            .set(ready);
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Controller started and, when elected, holding the lease
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Unix seconds of the last finished reconcile pass, 0 before the first one
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Record that a reconcile pass finished
    pub fn mark_reconciled(&self) {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        self.last_reconcile.store(now, Ordering::Relaxed);
    }

    /// Seconds since the last finished pass, `None` before the first one
    pub fn seconds_since_reconcile(&self) -> Option<u64> {
        let last = self.last_reconcile.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        Some(now.saturating_sub(last))
    }
}

/// Liveness probe: the process answers
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe, with the age of the last pass in the body
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if !state.is_ready().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response();
    }
    let body = match state.seconds_since_reconcile() {
        Some(age) => format!("ready, last reconcile {}s ago", age),
        None => "ready, no reconcile yet".to_string(),
    };
    (StatusCode::OK, body).into_response()
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("Health server listening on 0.0.0.0:8080");

    axum::serve(listener, app).await
}
