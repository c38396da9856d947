//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Calibration (polls, outcomes, artifact retries)
//! - Detection (sources before and after the flux floor)
//! - Catalog fan-out (per-backend queries and latency)
//! - Reconciliation (known / unknown verdicts)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Calibration
// =============================================================================

/// Status polls issued against the plate-solving service.
pub static CALIBRATION_POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "skyrecon_calibration_polls_total",
            "Total calibration status polls",
        ),
        &["phase", "result"], // phase: "job", "solve"; result: "ok", "error"
    )
    .unwrap()
});

/// Calibration runs by terminal outcome.
pub static CALIBRATION_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "skyrecon_calibration_outcomes_total",
            "Total calibration runs by outcome",
        ),
        &["outcome"], // "solved", "timed_out", "failed"
    )
    .unwrap()
});

/// Artifact download retries.
pub static ARTIFACT_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "skyrecon_artifact_retries_total",
            "Total artifact download retries",
        ),
        &["artifact"],
    )
    .unwrap()
});

/// Session re-authentications after an expired session.
pub static SESSION_REFRESHES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "skyrecon_session_refreshes_total",
        "Total re-authentications after session expiry",
    )
    .unwrap()
});

// =============================================================================
// Detection
// =============================================================================

/// Detected sources by stage.
pub static DETECTED_SOURCES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("skyrecon_detected_sources_total", "Total detected sources"),
        &["stage"], // "pre_filter", "post_filter"
    )
    .unwrap()
});

// =============================================================================
// Catalog
// =============================================================================

/// Catalog backend queries by status.
pub static CATALOG_QUERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "skyrecon_catalog_queries_total",
            "Total catalog backend queries",
        ),
        &["backend", "status"], // status: "success", "failure", "skipped", "cached"
    )
    .unwrap()
});

/// Catalog backend query duration in seconds.
pub static CATALOG_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "skyrecon_catalog_duration_seconds",
            "Duration of catalog backend queries",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["backend"],
    )
    .unwrap()
});

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconciled objects by verdict.
pub static RECONCILED_OBJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "skyrecon_reconciled_objects_total",
            "Total reconciled objects by verdict",
        ),
        &["verdict"], // "known", "unknown"
    )
    .unwrap()
});

/// Point conversions that failed during reconciliation.
pub static CONVERSION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "skyrecon_conversion_failures_total",
        "Total pixel to sky conversion failures",
    )
    .unwrap()
});

/// Get all metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Calibration
        Box::new(CALIBRATION_POLLS.clone()),
        Box::new(CALIBRATION_OUTCOMES.clone()),
        Box::new(ARTIFACT_RETRIES.clone()),
        Box::new(SESSION_REFRESHES.clone()),
        // Detection
        Box::new(DETECTED_SOURCES.clone()),
        // Catalog
        Box::new(CATALOG_QUERIES.clone()),
        Box::new(CATALOG_DURATION.clone()),
        // Reconciliation
        Box::new(RECONCILED_OBJECTS.clone()),
        Box::new(CONVERSION_FAILURES.clone()),
    ]
}
