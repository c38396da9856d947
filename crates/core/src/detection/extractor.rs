//! Blob-based source extractor.

use tracing::debug;

use super::background::estimate_background;
use super::measure::measure;
use super::segment::{deblend, extract_blobs, DeblendParams};
use super::{DetectedSource, DetectionConfig, DetectionError, DetectionReport, Raster, SourceDetector};
use crate::input::SourceImage;
use crate::metrics;

/// Production [`SourceDetector`].
#[derive(Debug, Clone, Default)]
pub struct BlobDetector {
    config: DetectionConfig,
}

impl BlobDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Run extraction on an already decoded raster.
    pub fn extract(&self, raster: &Raster) -> DetectionReport {
        let (w, h) = (raster.width(), raster.height());
        let background = estimate_background(raster, self.config.background_cell);
        let residual = background.subtract(raster);
        let threshold = self.config.threshold_sigma * background.rms;

        let blobs = extract_blobs(&residual, w, h, threshold, self.config.min_area);
        let params = DeblendParams {
            levels: self.config.deblend_levels,
            contrast: self.config.deblend_contrast,
            min_area: self.config.min_area,
        };

        let mut sources: Vec<DetectedSource> = blobs
            .into_iter()
            .flat_map(|blob| deblend(blob, &residual, w, threshold, params))
            .filter_map(|blob| measure(&blob, &residual, w, h, self.config.aperture_radius))
            .collect();

        let mut border_rejected = 0;
        if self.config.exclude_border {
            let margin = self.config.border_margin;
            let before = sources.len();
            sources.retain(|s| {
                s.x >= margin
                    && s.y >= margin
                    && s.x <= (w - 1) as f64 - margin
                    && s.y <= (h - 1) as f64 - margin
            });
            border_rejected = before - sources.len();
        }

        let pre_filter_count = sources.len();
        let (sources, floor) = apply_flux_floor(sources, self.config.flux_floor_multiplier);
        let post_filter_count = sources.len();

        debug!(
            background_rms = background.rms,
            threshold,
            pre_filter_count,
            post_filter_count,
            border_rejected,
            "Source extraction complete"
        );
        metrics::DETECTED_SOURCES
            .with_label_values(&["pre_filter"])
            .inc_by(pre_filter_count as u64);
        metrics::DETECTED_SOURCES
            .with_label_values(&["post_filter"])
            .inc_by(post_filter_count as u64);

        DetectionReport {
            sources,
            width: w as u32,
            height: h as u32,
            pre_filter_count,
            post_filter_count,
            border_rejected,
            background_rms: background.rms,
            flux_floor: floor,
        }
    }
}

impl SourceDetector for BlobDetector {
    fn detect(&self, image: &SourceImage) -> Result<DetectionReport, DetectionError> {
        let raster = Raster::decode(image.bytes())?;
        Ok(self.extract(&raster))
    }
}

/// `multiplier * median(fluxes)`, or `None` for an empty set.
pub fn flux_floor(fluxes: &[f64], multiplier: f64) -> Option<f64> {
    if fluxes.is_empty() {
        return None;
    }
    let mut sorted = fluxes.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let n = sorted.len();
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    Some(multiplier * median)
}

/// Keep sources whose flux is strictly above the adaptive floor.
pub fn apply_flux_floor(
    sources: Vec<DetectedSource>,
    multiplier: f64,
) -> (Vec<DetectedSource>, Option<f64>) {
    let fluxes: Vec<f64> = sources.iter().map(|s| s.flux).collect();
    match flux_floor(&fluxes, multiplier) {
        Some(floor) => (
            sources.into_iter().filter(|s| s.flux > floor).collect(),
            Some(floor),
        ),
        None => (sources, None),
    }
}
