//! Reconciliation pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::detection::SourceFlags;

/// Quality filter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Detections with any of these flag bits set are dropped.
    #[serde(default = "default_defect_mask")]
    pub defect_flag_mask: u32,

    #[serde(default = "default_min_npix")]
    pub min_npix: u32,

    /// Maximum allowed `a / b`.
    #[serde(default = "default_max_axis_ratio")]
    pub max_axis_ratio: f64,

    /// Flux floor as a fraction of the median flux.
    #[serde(default = "default_flux_multiplier")]
    pub flux_multiplier: f64,

    /// Centroids closer than this to an edge are dropped (pixels).
    #[serde(default = "default_border_margin")]
    pub border_margin: f64,
}

/// Match radii used by the uniqueness filter and catalog confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Detector vs. reference list, in pixels.
    #[serde(default = "default_pixel_radius")]
    pub pixel_radius: f64,

    /// Detection vs. catalog entry, in arcseconds.
    #[serde(default = "default_sky_radius")]
    pub sky_radius_arcsec: f64,

    /// Added to the covering region radius before querying catalogs.
    #[serde(default = "default_region_margin")]
    pub region_margin_arcsec: f64,
}

fn default_defect_mask() -> u32 {
    (SourceFlags::TRUNCATED | SourceFlags::APERTURE_TRUNCATED | SourceFlags::SINGULAR).bits()
}

fn default_min_npix() -> u32 {
    5
}

fn default_max_axis_ratio() -> f64 {
    3.0
}

fn default_flux_multiplier() -> f64 {
    0.3
}

fn default_border_margin() -> f64 {
    5.0
}

fn default_pixel_radius() -> f64 {
    5.0
}

fn default_sky_radius() -> f64 {
    10.0
}

fn default_region_margin() -> f64 {
    30.0
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            defect_flag_mask: default_defect_mask(),
            min_npix: default_min_npix(),
            max_axis_ratio: default_max_axis_ratio(),
            flux_multiplier: default_flux_multiplier(),
            border_margin: default_border_margin(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            pixel_radius: default_pixel_radius(),
            sky_radius_arcsec: default_sky_radius(),
            region_margin_arcsec: default_region_margin(),
        }
    }
}
