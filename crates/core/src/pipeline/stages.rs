//! Individual reconciliation stages. Each is a pure function over its inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::QualityConfig;
use super::{ConversionFailure, Counterpart, KnownObject, MatchResult, MatchUnit, UnknownObject};
use crate::catalog::{AggregatedCatalog, CatalogEntry, SkyRegion};
use crate::detection::{flux_floor, DetectedSource};
use crate::matching::{match_pixels, match_sky};
use crate::sky::{self, SkyPosition};
use crate::wcs::CoordinateTransform;

/// Why detections were dropped by the quality filter. A detection is counted
/// under the first criterion it fails, in field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub defect_flags: usize,
    pub too_small: usize,
    pub elongated: usize,
    pub border: usize,
    pub low_flux: usize,
}

impl RejectionCounts {
    pub fn total(&self) -> usize {
        self.defect_flags + self.too_small + self.elongated + self.border + self.low_flux
    }
}

/// Output of [`quality_filter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityResult {
    pub kept: Vec<DetectedSource>,
    pub rejected: RejectionCounts,
    pub flux_floor: Option<f64>,
}

/// Stage 1: drop defective, tiny, elongated, edge and faint detections.
///
/// `image_size` of `(0, 0)` disables the border check. When the detector
/// already applied a flux floor, pass it as `known_floor` so the median is
/// not recomputed over the reduced set.
pub fn quality_filter(
    sources: &[DetectedSource],
    image_size: (u32, u32),
    known_floor: Option<f64>,
    config: &QualityConfig,
) -> QualityResult {
    let mut rejected = RejectionCounts::default();
    let (width, height) = (image_size.0 as f64, image_size.1 as f64);
    let margin = config.border_margin;
    let check_border = image_size.0 > 0 && image_size.1 > 0;

    let shaped: Vec<DetectedSource> = sources
        .iter()
        .filter(|s| {
            if s.flags.intersects(config.defect_flag_mask) {
                rejected.defect_flags += 1;
                false
            } else if s.npix < config.min_npix {
                rejected.too_small += 1;
                false
            } else if s.axis_ratio() > config.max_axis_ratio {
                rejected.elongated += 1;
                false
            } else if check_border
                && (s.x < margin
                    || s.y < margin
                    || s.x > width - 1.0 - margin
                    || s.y > height - 1.0 - margin)
            {
                rejected.border += 1;
                false
            } else {
                true
            }
        })
        .copied()
        .collect();

    let floor = known_floor.or_else(|| {
        let fluxes: Vec<f64> = shaped.iter().map(|s| s.flux).collect();
        flux_floor(&fluxes, config.flux_multiplier)
    });

    let kept: Vec<DetectedSource> = match floor {
        Some(floor) => shaped
            .into_iter()
            .filter(|s| {
                let keep = s.flux > floor;
                if !keep {
                    rejected.low_flux += 1;
                }
                keep
            })
            .collect(),
        None => shaped,
    };

    debug!(
        input = sources.len(),
        kept = kept.len(),
        rejected = rejected.total(),
        flux_floor = ?floor,
        "Quality filter"
    );

    QualityResult {
        kept,
        rejected,
        flux_floor: floor,
    }
}

/// Stage 2: detections coinciding with a calibration reference source are
/// known by construction. Returns `(known, unique_to_detector)`.
pub fn split_by_reference(
    sources: Vec<DetectedSource>,
    reference: &[[f64; 2]],
    radius_px: f64,
    transform: &CoordinateTransform,
    observed_at: Option<DateTime<Utc>>,
) -> (Vec<KnownObject>, Vec<DetectedSource>) {
    let positions: Vec<[f64; 2]> = sources.iter().map(DetectedSource::position).collect();
    let partition = match_pixels(&positions, reference, radius_px);

    let known = partition
        .matched
        .iter()
        .map(|m| {
            let detection = sources[m.a_index];
            let [x, y] = reference[m.b_index];
            KnownObject {
                detection,
                sky: transform
                    .pixel_to_sky(detection.x, detection.y)
                    .ok()
                    .map(|p| p.at(observed_at)),
                best_match: MatchResult {
                    counterpart: Counterpart::Reference {
                        index: m.b_index,
                        x,
                        y,
                    },
                    separation: m.distance,
                    unit: MatchUnit::Pixels,
                },
            }
        })
        .collect();
    let unique = partition.unmatched.iter().map(|&i| sources[i]).collect();

    (known, unique)
}

/// Stage 3: pixel to sky, one point at a time. Failures are collected, not raised.
pub fn convert_to_sky(
    sources: Vec<DetectedSource>,
    transform: &CoordinateTransform,
    observed_at: Option<DateTime<Utc>>,
) -> (Vec<(DetectedSource, SkyPosition)>, Vec<ConversionFailure>) {
    let mut converted = Vec::with_capacity(sources.len());
    let mut failures = Vec::new();

    for source in sources {
        match transform.pixel_to_sky(source.x, source.y) {
            Ok(position) => converted.push((source, position.at(observed_at))),
            Err(e) => {
                debug!(x = source.x, y = source.y, error = %e, "Pixel to sky conversion failed");
                failures.push(ConversionFailure {
                    detection: source,
                    error: e.to_string(),
                });
            }
        }
    }

    (converted, failures)
}

/// Smallest cone around the centroid containing every position, plus a margin.
pub fn covering_region(
    positions: &[SkyPosition],
    margin_arcsec: f64,
    observed_at: Option<DateTime<Utc>>,
) -> Option<SkyRegion> {
    let center = sky::centroid(positions).or_else(|| positions.first().copied())?;
    let max_separation = positions
        .iter()
        .map(|p| center.separation_arcsec(p))
        .fold(0.0, f64::max);

    Some(SkyRegion::new(
        center.at(observed_at),
        max_separation + margin_arcsec,
        observed_at,
    ))
}

/// Stage 4: match sky positions against catalog entries.
/// Returns `(confirmed, unknown)`.
pub fn confirm_against_catalog(
    candidates: Vec<(DetectedSource, SkyPosition)>,
    catalog: &AggregatedCatalog,
    radius_arcsec: f64,
) -> (Vec<KnownObject>, Vec<UnknownObject>) {
    let entries: Vec<&CatalogEntry> = catalog.iter_entries().collect();
    let entry_positions: Vec<SkyPosition> = entries.iter().map(|e| e.position).collect();
    let positions: Vec<SkyPosition> = candidates.iter().map(|(_, p)| *p).collect();

    let partition = match_sky(&positions, &entry_positions, radius_arcsec);

    let known = partition
        .matched
        .iter()
        .map(|m| {
            let (detection, sky) = candidates[m.a_index];
            KnownObject {
                detection,
                sky: Some(sky),
                best_match: MatchResult {
                    counterpart: Counterpart::Catalog(entries[m.b_index].clone()),
                    separation: m.distance,
                    unit: MatchUnit::Arcsec,
                },
            }
        })
        .collect();
    let unknown = partition
        .unmatched
        .iter()
        .map(|&i| {
            let (detection, sky) = candidates[i];
            UnknownObject {
                detection,
                sky: Some(sky),
            }
        })
        .collect();

    (known, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogTag, PositionKey};
    use crate::detection::SourceFlags;
    use crate::testing::fixtures;

    fn config() -> QualityConfig {
        QualityConfig::default()
    }

    #[test]
    fn test_quality_flux_floor_example() {
        let sources: Vec<_> = [10.0, 15.0, 100.0, 200.0]
            .iter()
            .enumerate()
            .map(|(i, &flux)| fixtures::detection(20.0 + i as f64 * 10.0, 50.0, flux))
            .collect();

        let result = quality_filter(&sources, (100, 100), None, &config());
        assert!((result.flux_floor.unwrap() - 17.25).abs() < 1e-12);
        let fluxes: Vec<f64> = result.kept.iter().map(|s| s.flux).collect();
        assert_eq!(fluxes, vec![100.0, 200.0]);
        assert_eq!(result.rejected.low_flux, 2);
    }

    #[test]
    fn test_quality_uses_known_floor() {
        let sources = vec![
            fixtures::detection(50.0, 50.0, 40.0),
            fixtures::detection(60.0, 50.0, 100.0),
        ];
        // Recomputing would give 0.3 * 70 = 21; the detector's floor was 50.
        let result = quality_filter(&sources, (100, 100), Some(50.0), &config());
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.flux_floor, Some(50.0));
    }

    #[test]
    fn test_quality_rejection_reasons() {
        let mut flagged = fixtures::detection(50.0, 50.0, 100.0);
        flagged.flags = SourceFlags::TRUNCATED;
        let mut merged = fixtures::detection(50.0, 60.0, 100.0);
        merged.flags = SourceFlags::MERGED;
        let mut small = fixtures::detection(50.0, 70.0, 100.0);
        small.npix = 2;
        let mut elongated = fixtures::detection(50.0, 80.0, 100.0);
        elongated.a = 4.0;
        elongated.b = 1.0;
        let edge = fixtures::detection(2.0, 50.0, 100.0);
        let far_edge = fixtures::detection(95.0, 50.0, 100.0);

        let sources = vec![flagged, merged, small, elongated, edge, far_edge];
        let result = quality_filter(&sources, (100, 100), None, &config());

        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.kept[0].flags, SourceFlags::MERGED);
        assert_eq!(
            result.rejected,
            RejectionCounts {
                defect_flags: 1,
                too_small: 1,
                elongated: 1,
                border: 2,
                low_flux: 0,
            }
        );
    }

    #[test]
    fn test_quality_unknown_size_skips_border() {
        let sources = vec![fixtures::detection(0.5, 0.5, 100.0)];
        let result = quality_filter(&sources, (0, 0), None, &config());
        assert_eq!(result.kept.len(), 1);
    }

    #[test]
    fn test_split_by_reference() {
        let transform = fixtures::tan_transform(150.0, 2.0, 1.0);
        let sources = vec![
            fixtures::detection(10.0, 10.0, 100.0),
            fixtures::detection(50.0, 50.0, 100.0),
        ];
        let (known, unique) =
            split_by_reference(sources, &[[11.0, 10.0]], 5.0, &transform, None);

        assert_eq!(known.len(), 1);
        assert_eq!(known[0].detection.x, 10.0);
        assert_eq!(known[0].best_match.unit, MatchUnit::Pixels);
        assert_eq!(known[0].best_match.separation, 1.0);
        assert!(known[0].sky.is_some());
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].x, 50.0);
    }

    #[test]
    fn test_convert_to_sky_records_failures() {
        let transform = fixtures::tan_transform(150.0, 2.0, 1.0);
        let sources = vec![
            fixtures::detection(10.0, 10.0, 100.0),
            fixtures::detection(f64::NAN, 10.0, 100.0),
        ];
        let (converted, failures) = convert_to_sky(sources, &transform, None);
        assert_eq!(converted.len(), 1);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].detection.x.is_nan());
    }

    #[test]
    fn test_covering_region() {
        let a = SkyPosition::new(10.0, 0.0);
        let b = SkyPosition::new(10.0, 0.02);
        let region = covering_region(&[a, b], 30.0, None).unwrap();
        assert!((region.center.dec_deg - 0.01).abs() < 1e-9);
        assert!((region.radius_arcsec - 66.0).abs() < 1e-6);
        assert!(region.contains(&a) && region.contains(&b));
        assert!(covering_region(&[], 30.0, None).is_none());
    }

    #[test]
    fn test_confirm_against_catalog() {
        let here = SkyPosition::new(10.0, 10.0);
        let there = SkyPosition::new(10.0, 10.1);
        let mut catalog = AggregatedCatalog::default();
        let entry = fixtures::catalog_entry(CatalogTag::GaiaDr3, 10.0, 10.0 + 2.0 / 3600.0);
        catalog
            .entries
            .insert(PositionKey::from_position(&entry.position, 1.0), vec![entry]);

        let candidates = vec![
            (fixtures::detection(1.0, 1.0, 10.0), here),
            (fixtures::detection(2.0, 2.0, 10.0), there),
        ];
        let (known, unknown) = confirm_against_catalog(candidates, &catalog, 10.0);

        assert_eq!(known.len(), 1);
        assert_eq!(known[0].best_match.unit, MatchUnit::Arcsec);
        assert!((known[0].best_match.separation - 2.0).abs() < 1e-6);
        assert!(matches!(
            known[0].best_match.counterpart,
            Counterpart::Catalog(ref e) if e.tag == CatalogTag::GaiaDr3
        ));
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].sky, Some(there));
    }
}
