//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `infisical_operator_reconciliations_total` - Total number of reconciliations
//! - `infisical_operator_reconciliation_errors_total` - Total number of reconciliation errors
//! - `infisical_operator_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `infisical_operator_secrets_pulled_total` - Total number of secrets pulled from Infisical
//! - `infisical_operator_secrets_pushed_total` - Total number of secrets pushed to Infisical
//! - `infisical_operator_stream_reconnects_total` - Total number of event stream reconnect attempts
//! - `infisical_operator_live_streams` - Current number of live event streams

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "infisical_operator_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "infisical_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "infisical_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static SECRETS_PULLED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "infisical_operator_secrets_pulled_total",
        "Total number of secrets pulled from Infisical",
    )
    .expect("Failed to create SECRETS_PULLED_TOTAL metric - this should never happen")
});

static SECRETS_PUSHED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "infisical_operator_secrets_pushed_total",
        "Total number of secrets pushed to Infisical",
    )
    .expect("Failed to create SECRETS_PUSHED_TOTAL metric - this should never happen")
});

static STREAM_RECONNECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "infisical_operator_stream_reconnects_total",
        "Total number of event stream reconnect attempts",
    )
    .expect("Failed to create STREAM_RECONNECTS_TOTAL metric - this should never happen")
});

static LIVE_STREAMS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "infisical_operator_live_streams",
        "Current number of live event streams",
    )
    .expect("Failed to create LIVE_STREAMS metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SECRETS_PULLED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRETS_PUSHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STREAM_RECONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIVE_STREAMS.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_secrets_pulled(count: i64) {
    SECRETS_PULLED_TOTAL.inc_by(count.max(0) as u64);
}

pub fn increment_secrets_pushed(count: i64) {
    SECRETS_PUSHED_TOTAL.inc_by(count.max(0) as u64);
}

pub fn increment_stream_reconnects() {
    STREAM_RECONNECTS_TOTAL.inc();
}

pub fn stream_opened() {
    LIVE_STREAMS.inc();
}

pub fn stream_closed() {
    LIVE_STREAMS.dec();
}
