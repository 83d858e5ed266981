//! # Health and Metrics Endpoints
//!
//! HTTP surface the operator exposes for Kubernetes probes and Prometheus
//! scraping:
//!
//! - `/healthz` - liveness; the process is up
//! - `/readyz` - readiness; flips once the controllers are watching and
//!   flips back during shutdown so the endpoint drains cleanly
//! - `/metrics` - the operator's Prometheus registry in text format

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Readiness signal shared between the bootstrap and the probe handlers.
/// Not ready until the controllers have been wired up.
#[derive(Default)]
pub struct OperatorHealth {
    controllers_started: AtomicBool,
}

impl OperatorHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called once the CRD controllers are running.
    pub fn mark_ready(&self) {
        self.controllers_started.store(true, Ordering::Relaxed);
    }

    /// Called when shutdown begins so the Service stops routing here.
    pub fn mark_not_ready(&self) {
        self.controllers_started.store(false, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.controllers_started.load(Ordering::Relaxed)
    }
}

/// Encode the operator's metric families in the Prometheus text format.
fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(
        &crate::observability::metrics::REGISTRY.gather(),
        &mut buffer,
    )?;
    Ok(buffer)
}

pub fn router(health: Arc<OperatorHealth>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health)
}

/// Bind and serve the probe/metrics endpoints until the process exits.
pub async fn serve(port: u16, health: Arc<OperatorHealth>) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "probe and metrics server listening");
    axum::serve(listener, router(health)).await?;
    Ok(())
}

async fn readyz(State(health): State<Arc<OperatorHealth>>) -> impl IntoResponse {
    if health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "controllers not started")
    }
}

async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_starts_not_ready() {
        let health = OperatorHealth::new();
        assert!(!health.is_ready());
    }

    #[test]
    fn test_health_ready_round_trip() {
        let health = OperatorHealth::new();
        health.mark_ready();
        assert!(health.is_ready());
        health.mark_not_ready();
        assert!(!health.is_ready());
    }

    #[test]
    fn test_encode_metrics_produces_text_format() {
        crate::observability::metrics::register_metrics().ok();
        crate::observability::metrics::increment_reconciliations();
        let body = encode_metrics().expect("metrics must encode");
        let text = String::from_utf8(body).expect("text format is UTF-8");
        assert!(text.contains("infisical_operator_reconciliations_total"));
    }
}
