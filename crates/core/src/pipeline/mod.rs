//! Detection reconciliation.
//!
//! Five stages turn a detection report and a calibration into a known /
//! unknown verdict per detection:
//!
//! 1. quality filter
//! 2. uniqueness against the calibration reference list (pixel space)
//! 3. pixel to sky conversion, failing per point
//! 4. one catalog query for the covering region, then sky-space matching
//! 5. partition into known and unknown
//!
//! Every detection that survives stage 1 ends up in exactly one of the two
//! output sets.

mod config;
pub mod stages;

pub use config::{MatchingConfig, QualityConfig};
pub use stages::{QualityResult, RejectionCounts};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::calibration::CalibrationSolution;
use crate::catalog::{BackendFailure, CatalogEntry, CatalogSource, CatalogTag, SkyRegion};
use crate::detection::{DetectedSource, DetectionReport};
use crate::metrics;
use crate::sky::SkyPosition;

/// Distance unit of a [`MatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchUnit {
    Pixels,
    Arcsec,
}

/// What a detection was matched to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Counterpart {
    /// A calibration reference source (0-based pixels).
    Reference { index: usize, x: f64, y: f64 },
    Catalog(CatalogEntry),
}

/// Best counterpart of a detection. `separation` is strictly below the
/// match radius in `unit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub counterpart: Counterpart,
    pub separation: f64,
    pub unit: MatchUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownObject {
    pub detection: DetectedSource,
    pub sky: Option<SkyPosition>,
    pub best_match: MatchResult,
}

/// A detection with no counterpart. `sky` is `None` when conversion failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownObject {
    pub detection: DetectedSource,
    pub sky: Option<SkyPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionFailure {
    pub detection: DetectedSource,
    pub error: String,
}

/// Disjoint known / unknown sets covering the quality-filtered detections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationOutcome {
    pub known: Vec<KnownObject>,
    pub unknown: Vec<UnknownObject>,
}

impl ReconciliationOutcome {
    pub fn total(&self) -> usize {
        self.known.len() + self.unknown.len()
    }

    pub fn unknown_positions(&self) -> Vec<[f64; 2]> {
        self.unknown.iter().map(|u| u.detection.position()).collect()
    }
}

/// How many detections each stage saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub detected: usize,
    pub quality_passed: usize,
    pub reference_matched: usize,
    pub converted: usize,
    pub conversion_failed: usize,
    pub catalog_matched: usize,
    pub unknown: usize,
}

/// Full result of one reconciliation, including degraded inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub outcome: ReconciliationOutcome,
    pub stage_counts: StageCounts,
    pub rejected: RejectionCounts,
    pub flux_floor: Option<f64>,
    pub conversion_errors: Vec<ConversionFailure>,
    /// Region sent to the catalogs; `None` when nothing needed confirming.
    pub region: Option<SkyRegion>,
    pub catalog_entries: usize,
    pub catalog_failures: Vec<BackendFailure>,
    pub skipped_catalogs: Vec<CatalogTag>,
    /// Catalogs whose answer was capped; unknowns near them are less certain.
    pub truncated_catalogs: Vec<CatalogTag>,
    /// The calibration came without a reference list.
    pub reference_degraded: bool,
}

/// Runs the reconciliation stages.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPipeline {
    quality: QualityConfig,
    matching: MatchingConfig,
}

impl ReconciliationPipeline {
    pub fn new(quality: QualityConfig, matching: MatchingConfig) -> Self {
        Self { quality, matching }
    }

    pub fn quality(&self) -> &QualityConfig {
        &self.quality
    }

    pub fn matching(&self) -> &MatchingConfig {
        &self.matching
    }

    /// Reconcile one image. Never fails: missing catalog data only shrinks
    /// the known set.
    pub async fn reconcile(
        &self,
        detections: &DetectionReport,
        calibration: &CalibrationSolution,
        catalog: &dyn CatalogSource,
        observed_at: Option<DateTime<Utc>>,
    ) -> ReconciliationReport {
        let mut counts = StageCounts {
            detected: detections.sources.len(),
            ..Default::default()
        };

        // Stage 1
        let image_size = if detections.width > 0 && detections.height > 0 {
            (detections.width, detections.height)
        } else {
            calibration.transform.image_size().unwrap_or((0, 0))
        };
        let quality = stages::quality_filter(
            &detections.sources,
            image_size,
            detections.flux_floor,
            &self.quality,
        );
        counts.quality_passed = quality.kept.len();

        // Stage 2
        let (mut known, unique) = stages::split_by_reference(
            quality.kept,
            &calibration.reference_sources,
            self.matching.pixel_radius,
            &calibration.transform,
            observed_at,
        );
        counts.reference_matched = known.len();
        debug!(
            reference_matched = known.len(),
            unique = unique.len(),
            reference_degraded = calibration.reference_degraded,
            "Uniqueness filter"
        );

        // Stage 3
        let (converted, conversion_errors) =
            stages::convert_to_sky(unique, &calibration.transform, observed_at);
        counts.converted = converted.len();
        counts.conversion_failed = conversion_errors.len();
        metrics::CONVERSION_FAILURES.inc_by(conversion_errors.len() as u64);

        // Stage 4
        let positions: Vec<SkyPosition> = converted.iter().map(|(_, p)| *p).collect();
        let region = stages::covering_region(
            &positions,
            self.matching.region_margin_arcsec,
            observed_at,
        );
        let aggregated = match &region {
            Some(region) => catalog.query_region(region).await,
            None => Default::default(),
        };
        let (confirmed, mut unknown) = stages::confirm_against_catalog(
            converted,
            &aggregated,
            self.matching.sky_radius_arcsec,
        );
        counts.catalog_matched = confirmed.len();

        // Stage 5
        known.extend(confirmed);
        unknown.extend(conversion_errors.iter().map(|f| UnknownObject {
            detection: f.detection,
            sky: None,
        }));
        counts.unknown = unknown.len();

        metrics::RECONCILED_OBJECTS
            .with_label_values(&["known"])
            .inc_by(known.len() as u64);
        metrics::RECONCILED_OBJECTS
            .with_label_values(&["unknown"])
            .inc_by(unknown.len() as u64);

        info!(
            detected = counts.detected,
            filtered = counts.quality_passed,
            known = known.len(),
            unknown = unknown.len(),
            catalog_failures = aggregated.failures.len(),
            "Reconciliation complete"
        );

        ReconciliationReport {
            outcome: ReconciliationOutcome { known, unknown },
            stage_counts: counts,
            rejected: quality.rejected,
            flux_floor: quality.flux_floor,
            conversion_errors,
            region,
            catalog_entries: aggregated.len(),
            catalog_failures: aggregated.failures,
            skipped_catalogs: aggregated.skipped,
            truncated_catalogs: aggregated.truncated,
            reference_degraded: calibration.reference_degraded,
        }
    }
}
