//! Centroid, shape and aperture photometry for segmented blobs.

use super::segment::Blob;
use super::{DetectedSource, SourceFlags};

/// Minimum determinant of the second-moment matrix before it is treated as
/// singular (single-pixel or line-like blobs).
const SINGULAR_DET: f64 = 1.0 / 144.0;

/// Measure a blob on the background-subtracted image.
///
/// Returns `None` when the blob carries no positive flux.
pub(crate) fn measure(
    blob: &Blob,
    residual: &[f32],
    width: usize,
    height: usize,
    aperture_radius: f64,
) -> Option<DetectedSource> {
    let mut flags = SourceFlags::NONE;
    if blob.merged {
        flags.insert(SourceFlags::MERGED);
    }

    let (mut sw, mut sx, mut sy) = (0.0f64, 0.0f64, 0.0f64);
    for &i in &blob.pixels {
        let w = residual[i].max(0.0) as f64;
        let (x, y) = ((i % width) as f64, (i / width) as f64);
        sw += w;
        sx += w * x;
        sy += w * y;

        if x == 0.0 || y == 0.0 || i % width == width - 1 || i / width == height - 1 {
            flags.insert(SourceFlags::TRUNCATED);
        }
    }
    if sw <= 0.0 {
        return None;
    }
    let (cx, cy) = (sx / sw, sy / sw);

    let (mut x2, mut y2, mut xy) = (0.0f64, 0.0f64, 0.0f64);
    for &i in &blob.pixels {
        let w = residual[i].max(0.0) as f64;
        let dx = (i % width) as f64 - cx;
        let dy = (i / width) as f64 - cy;
        x2 += w * dx * dx;
        y2 += w * dy * dy;
        xy += w * dx * dy;
    }
    x2 /= sw;
    y2 /= sw;
    xy /= sw;

    if x2 * y2 - xy * xy < SINGULAR_DET {
        x2 += 1.0 / 12.0;
        y2 += 1.0 / 12.0;
        flags.insert(SourceFlags::SINGULAR);
    }

    let half_sum = (x2 + y2) / 2.0;
    let root = (((x2 - y2) / 2.0).powi(2) + xy * xy).sqrt();
    let a = (half_sum + root).sqrt();
    let b = (half_sum - root).max(f64::EPSILON).sqrt();
    let theta = 0.5 * (2.0 * xy).atan2(x2 - y2);

    let (flux, truncated) = aperture_flux(residual, width, height, cx, cy, aperture_radius);
    if truncated {
        flags.insert(SourceFlags::APERTURE_TRUNCATED);
    }

    Some(DetectedSource {
        x: cx,
        y: cy,
        flux: flux.max(0.0),
        a,
        b,
        theta,
        npix: blob.pixels.len() as u32,
        flags,
    })
}

/// Sum of residual over pixel centres within `radius` of `(cx, cy)`.
/// The flag reports whether the aperture extends past the image edge.
pub(crate) fn aperture_flux(
    residual: &[f32],
    width: usize,
    height: usize,
    cx: f64,
    cy: f64,
    radius: f64,
) -> (f64, bool) {
    let truncated = cx - radius < 0.0
        || cy - radius < 0.0
        || cx + radius > (width - 1) as f64
        || cy + radius > (height - 1) as f64;

    let x_lo = (cx - radius).floor().max(0.0) as usize;
    let y_lo = (cy - radius).floor().max(0.0) as usize;
    let x_hi = ((cx + radius).ceil() as usize).min(width - 1);
    let y_hi = ((cy + radius).ceil() as usize).min(height - 1);
    let r_sq = radius * radius;

    let mut sum = 0.0f64;
    for y in y_lo..=y_hi {
        for x in x_lo..=x_hi {
            let (dx, dy) = (x as f64 - cx, y as f64 - cy);
            if dx * dx + dy * dy <= r_sq {
                sum += residual[y * width + x] as f64;
            }
        }
    }
    (sum, truncated)
}
