use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that reports ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready or draining.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the HTTP routes for health probes, without metrics.
pub fn health_router(health_state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())))
}

/// Serve `/metrics`, `/healthz` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder is already installed or
/// binding the HTTP listener fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = health_router(health_state).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Returns 200 while accepting clients, 503 once draining.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "draining",
                ready: false,
            }),
        )
    }
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the registered connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("tether_connections_active").increment(1.0);
    }

    /// Decrement the registered connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("tether_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a WebSocket upgrade with the given status label.
    pub fn handshakes_total(status: &'static str) {
        metrics::counter!("tether_handshakes_total", "status" => status).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("tether_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("tether_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record a connection closed from outside its task.
    pub fn disconnects_total(reason: &'static str) {
        metrics::counter!("tether_disconnects_total", "reason" => reason).increment(1);
    }

    /// Record frame bytes in the given direction.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("tether_payload_bytes_total", "direction" => direction).increment(bytes);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a relay latency observation in seconds.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("tether_relay_latency_seconds").record(value);
    }
}
