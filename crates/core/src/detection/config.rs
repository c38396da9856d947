//! Source detection configuration.

use serde::{Deserialize, Serialize};

/// Tunables for background estimation, segmentation and photometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Detection threshold in units of background noise.
    #[serde(default = "default_threshold_sigma")]
    pub threshold_sigma: f32,

    /// Minimum connected pixels for a blob.
    #[serde(default = "default_min_area")]
    pub min_area: usize,

    /// Number of intermediate thresholds tried when deblending.
    #[serde(default = "default_deblend_levels")]
    pub deblend_levels: usize,

    /// Minimum fraction of the parent flux a branch needs to be split off.
    #[serde(default = "default_deblend_contrast")]
    pub deblend_contrast: f64,

    /// Radius of the circular photometry aperture (pixels).
    #[serde(default = "default_aperture_radius")]
    pub aperture_radius: f64,

    /// Sources with flux at or below `multiplier * median(flux)` are dropped.
    #[serde(default = "default_flux_floor_multiplier")]
    pub flux_floor_multiplier: f64,

    /// Drop sources whose centroid lies within `border_margin` of the edge.
    #[serde(default)]
    pub exclude_border: bool,

    #[serde(default = "default_border_margin")]
    pub border_margin: f64,

    /// Side length of the background mesh cells (pixels).
    #[serde(default = "default_background_cell")]
    pub background_cell: usize,
}

fn default_threshold_sigma() -> f32 {
    5.0
}

fn default_min_area() -> usize {
    10
}

fn default_deblend_levels() -> usize {
    32
}

fn default_deblend_contrast() -> f64 {
    0.005
}

fn default_aperture_radius() -> f64 {
    5.0
}

fn default_flux_floor_multiplier() -> f64 {
    0.3
}

fn default_border_margin() -> f64 {
    5.0
}

fn default_background_cell() -> usize {
    64
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_sigma: default_threshold_sigma(),
            min_area: default_min_area(),
            deblend_levels: default_deblend_levels(),
            deblend_contrast: default_deblend_contrast(),
            aperture_radius: default_aperture_radius(),
            flux_floor_multiplier: default_flux_floor_multiplier(),
            exclude_border: false,
            border_margin: default_border_margin(),
            background_cell: default_background_cell(),
        }
    }
}
