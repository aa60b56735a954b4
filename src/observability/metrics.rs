//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `trust_controller_reconciliations_total` - Reconciliations per controller
//! - `trust_controller_reconciliation_errors_total` - Failed reconciliations per controller
//! - `trust_controller_reconciliation_duration_seconds` - Reconciliation duration per controller
//! - `trust_controller_certificates_minted_total` - Certificates minted per item (`ca`, `serving`)
//! - `trust_controller_provider_updates_total` - Content changes per trust material provider
//! - `trust_controller_agent_pods_created_total` - Agent pods created
//! - `trust_controller_agent_pods_deleted_total` - Agent pods deleted (drift, orphans, terminated)
//! - `trust_controller_status_write_conflicts_total` - CredentialIssuer status write conflicts

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trust_controller_reconciliations_total",
            "Total number of reconciliations",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trust_controller_reconciliation_errors_total",
            "Total number of reconciliation errors",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "trust_controller_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static CERTIFICATES_MINTED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trust_controller_certificates_minted_total",
            "Total number of certificates minted",
        ),
        &["item"],
    )
    .expect("Failed to create CERTIFICATES_MINTED_TOTAL metric - this should never happen")
});

static PROVIDER_UPDATES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trust_controller_provider_updates_total",
            "Total number of trust material provider content changes",
        ),
        &["provider"],
    )
    .expect("Failed to create PROVIDER_UPDATES_TOTAL metric - this should never happen")
});

static AGENT_PODS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "trust_controller_agent_pods_created_total",
        "Total number of agent pods created",
    )
    .expect("Failed to create AGENT_PODS_CREATED_TOTAL metric - this should never happen")
});

static AGENT_PODS_DELETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "trust_controller_agent_pods_deleted_total",
        "Total number of agent pods deleted",
    )
    .expect("Failed to create AGENT_PODS_DELETED_TOTAL metric - this should never happen")
});

static STATUS_WRITE_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "trust_controller_status_write_conflicts_total",
        "Total number of CredentialIssuer status writes rejected by a conflict",
    )
    .expect("Failed to create STATUS_WRITE_CONFLICTS_TOTAL metric - this should never happen")
});

/// Register all metrics with the process-wide registry
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(CERTIFICATES_MINTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AGENT_PODS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AGENT_PODS_DELETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_WRITE_CONFLICTS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(controller: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_reconciliation_errors(controller: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[controller])
        .inc();
}

pub fn observe_reconciliation_duration(controller: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(duration);
}

pub fn increment_certificates_minted(item: &str) {
    CERTIFICATES_MINTED_TOTAL.with_label_values(&[item]).inc();
}

pub fn increment_provider_updates(provider: &str) {
    PROVIDER_UPDATES_TOTAL.with_label_values(&[provider]).inc();
}

pub fn increment_agent_pods_created(count: u64) {
    AGENT_PODS_CREATED_TOTAL.inc_by(count);
}

pub fn increment_agent_pods_deleted(count: u64) {
    AGENT_PODS_DELETED_TOTAL.inc_by(count);
}

pub fn increment_status_write_conflicts() {
    STATUS_WRITE_CONFLICTS_TOTAL.inc();
}

/// Encode every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
