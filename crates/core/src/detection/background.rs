//! Smooth background and noise estimation.

use super::Raster;

const CLIP_SIGMA: f32 = 3.0;
const CLIP_ITERATIONS: usize = 5;
const MAD_TO_SIGMA: f32 = 1.4826;

/// Per-pixel background level and global noise estimate.
#[derive(Debug, Clone)]
pub struct Background {
    pub level: Vec<f32>,
    pub rms: f32,
}

impl Background {
    /// Background-subtracted pixels.
    pub fn subtract(&self, raster: &Raster) -> Vec<f32> {
        raster
            .pixels()
            .iter()
            .zip(&self.level)
            .map(|(v, b)| v - b)
            .collect()
    }
}

/// Estimate the background on a mesh of `cell`-sized blocks (sigma-clipped
/// medians), bilinearly interpolated between block centres. Noise is the
/// sigma-clipped spread of the residual over the whole image.
pub fn estimate_background(raster: &Raster, cell: usize) -> Background {
    let (w, h) = (raster.width(), raster.height());
    let bs = cell.clamp(1, w.max(h));
    let nx = w.div_ceil(bs);
    let ny = h.div_ceil(bs);

    let mut block_levels = vec![0.0f32; nx * ny];
    for by in 0..ny {
        for bx in 0..nx {
            let (x0, y0) = (bx * bs, by * bs);
            let (x1, y1) = ((x0 + bs).min(w), (y0 + bs).min(h));
            let mut values: Vec<f32> = (y0..y1)
                .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                .map(|(x, y)| raster.get(x, y))
                .filter(|v| v.is_finite())
                .collect();
            block_levels[by * nx + bx] = clipped_stats(&mut values).0;
        }
    }

    let half = bs as f32 / 2.0;
    let mut level = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let bx_f = (x as f32 - half) / bs as f32;
            let by_f = (y as f32 - half) / bs as f32;

            let bx0 = (bx_f.floor().max(0.0) as usize).min(nx - 1);
            let by0 = (by_f.floor().max(0.0) as usize).min(ny - 1);
            let bx1 = (bx0 + 1).min(nx - 1);
            let by1 = (by0 + 1).min(ny - 1);

            let fx = (bx_f - bx0 as f32).clamp(0.0, 1.0);
            let fy = (by_f - by0 as f32).clamp(0.0, 1.0);

            let m00 = block_levels[by0 * nx + bx0];
            let m10 = block_levels[by0 * nx + bx1];
            let m01 = block_levels[by1 * nx + bx0];
            let m11 = block_levels[by1 * nx + bx1];

            level.push(
                m00 * (1.0 - fx) * (1.0 - fy)
                    + m10 * fx * (1.0 - fy)
                    + m01 * (1.0 - fx) * fy
                    + m11 * fx * fy,
            );
        }
    }

    let mut residual: Vec<f32> = raster
        .pixels()
        .iter()
        .zip(&level)
        .map(|(v, b)| v - b)
        .filter(|v| v.is_finite())
        .collect();
    let (_, rms) = clipped_stats(&mut residual);

    Background { level, rms }
}

/// Sigma-clipped `(median, sigma)`, sigma from the median absolute deviation
/// with a standard-deviation fallback for quantised data.
pub(crate) fn clipped_stats(values: &mut Vec<f32>) -> (f32, f32) {
    let mut median = 0.0;
    let mut sigma = 0.0;

    for _ in 0..CLIP_ITERATIONS {
        if values.is_empty() {
            break;
        }
        median = median_of(values);
        let mut deviations: Vec<f32> = values.iter().map(|v| (v - median).abs()).collect();
        sigma = MAD_TO_SIGMA * median_of(&mut deviations);
        if sigma <= 0.0 {
            sigma = std_dev(values);
        }
        if sigma <= 0.0 {
            break;
        }

        let before = values.len();
        values.retain(|v| (v - median).abs() <= CLIP_SIGMA * sigma);
        if values.len() == before {
            break;
        }
    }

    (median, sigma)
}

/// Median of a slice (mean of the two middle values for even lengths).
/// Reorders the slice.
pub(crate) fn median_of(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(f32::total_cmp);
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    }
}

fn std_dev(values: &[f32]) -> f32 {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    var.sqrt() as f32
}
