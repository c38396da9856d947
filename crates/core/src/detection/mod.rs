//! Local source extraction.
//!
//! Background subtraction, thresholding with deblending, fixed-aperture
//! photometry, then an adaptive flux floor relative to the median flux.

mod background;
mod config;
mod extractor;
mod measure;
mod raster;
mod segment;

pub use background::{estimate_background, Background};
pub use config::DetectionConfig;
pub use extractor::{apply_flux_floor, flux_floor, BlobDetector};
pub use raster::Raster;

use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fits::FitsError;
use crate::input::SourceImage;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Fits(#[from] FitsError),
}

/// Quality flags attached to a detection (bitmask).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceFlags(u32);

impl SourceFlags {
    pub const NONE: Self = Self(0);
    /// Split from a larger blob by deblending.
    pub const MERGED: Self = Self(1);
    /// Blob touches the image edge.
    pub const TRUNCATED: Self = Self(2);
    /// Photometry aperture extends past the image edge.
    pub const APERTURE_TRUNCATED: Self = Self(16);
    /// Second-moment matrix was degenerate.
    pub const SINGULAR: Self = Self(32);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for SourceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A source found by local extraction. Pixel coordinates are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedSource {
    pub x: f64,
    pub y: f64,
    /// Background-subtracted aperture flux, never negative.
    pub flux: f64,
    /// Semi-major axis (pixels).
    pub a: f64,
    /// Semi-minor axis (pixels).
    pub b: f64,
    /// Position angle of the major axis, radians from +x towards +y.
    pub theta: f64,
    pub npix: u32,
    pub flags: SourceFlags,
}

impl DetectedSource {
    pub fn position(&self) -> [f64; 2] {
        [self.x, self.y]
    }

    /// Major over minor axis.
    pub fn axis_ratio(&self) -> f64 {
        if self.b > 0.0 {
            self.a / self.b
        } else {
            f64::INFINITY
        }
    }
}

/// Result of one extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub sources: Vec<DetectedSource>,
    pub width: u32,
    pub height: u32,
    /// Sources measured before the flux floor was applied.
    pub pre_filter_count: usize,
    /// Sources left after the flux floor.
    pub post_filter_count: usize,
    /// Sources removed by the optional border exclusion.
    pub border_rejected: usize,
    pub background_rms: f32,
    pub flux_floor: Option<f64>,
}

/// Extracts candidate sources from an image.
pub trait SourceDetector: Send + Sync {
    fn detect(&self, image: &SourceImage) -> Result<DetectionReport, DetectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_ops() {
        let mut flags = SourceFlags::NONE;
        assert!(flags.is_empty());
        flags.insert(SourceFlags::TRUNCATED);
        let both = flags | SourceFlags::SINGULAR;
        assert!(both.contains(SourceFlags::TRUNCATED));
        assert!(both.contains(SourceFlags::SINGULAR));
        assert!(!both.contains(SourceFlags::MERGED));
        assert_eq!(both.bits(), 34);
        assert!(both.intersects(2));
        assert!(!both.intersects(1));
    }

    #[test]
    fn test_flags_serialize_as_int() {
        let json = serde_json::to_string(&SourceFlags::from_bits(17)).unwrap();
        assert_eq!(json, "17");
    }

    #[test]
    fn test_axis_ratio() {
        let s = DetectedSource {
            x: 0.0,
            y: 0.0,
            flux: 1.0,
            a: 3.0,
            b: 1.5,
            theta: 0.0,
            npix: 10,
            flags: SourceFlags::NONE,
        };
        assert_eq!(s.axis_ratio(), 2.0);
        assert_eq!(s.position(), [0.0, 0.0]);
    }
}
