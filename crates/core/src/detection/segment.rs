//! Thresholded segmentation and multi-threshold deblending.

use std::collections::HashMap;

/// Connected set of above-threshold pixels (linear indices into the image).
#[derive(Debug, Clone)]
pub(crate) struct Blob {
    pub pixels: Vec<usize>,
    pub merged: bool,
}

/// Deblending parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeblendParams {
    pub levels: usize,
    pub contrast: f64,
    pub min_area: usize,
}

/// Label 8-connected components of `mask` with two-pass union-find.
///
/// Returns sequential labels (0 = background) and the component count.
pub(crate) fn label_components(mask: &[bool], width: usize, height: usize) -> (Vec<u32>, u32) {
    fn find(parent: &mut [u32], mut x: u32) -> u32 {
        while parent[x as usize] != x {
            parent[x as usize] = parent[parent[x as usize] as usize];
            x = parent[x as usize];
        }
        x
    }

    fn union(parent: &mut [u32], a: u32, b: u32) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra < rb {
            parent[rb as usize] = ra;
        } else if rb < ra {
            parent[ra as usize] = rb;
        }
    }

    let mut labels = vec![0u32; width * height];
    let mut parent: Vec<u32> = vec![0];

    for row in 0..height {
        for col in 0..width {
            let idx = row * width + col;
            if !mask[idx] {
                continue;
            }

            let mut neighbours = [0u32; 4];
            let mut count = 0;
            let mut push = |label: u32| {
                if label > 0 {
                    neighbours[count] = label;
                    count += 1;
                }
            };
            if col > 0 {
                push(labels[idx - 1]);
            }
            if row > 0 {
                push(labels[idx - width]);
                if col > 0 {
                    push(labels[idx - width - 1]);
                }
                if col + 1 < width {
                    push(labels[idx - width + 1]);
                }
            }

            match neighbours[..count].iter().min() {
                None => {
                    let label = parent.len() as u32;
                    parent.push(label);
                    labels[idx] = label;
                }
                Some(&min_label) => {
                    labels[idx] = min_label;
                    for &n in &neighbours[..count] {
                        union(&mut parent, min_label, n);
                    }
                }
            }
        }
    }

    let mut root_map: HashMap<u32, u32> = HashMap::new();
    for label in labels.iter_mut().filter(|l| **l > 0) {
        let root = find(&mut parent, *label);
        let next = root_map.len() as u32 + 1;
        *label = *root_map.entry(root).or_insert(next);
    }

    (labels, root_map.len() as u32)
}

/// Connected regions of `residual > threshold` with at least `min_area` pixels.
pub(crate) fn extract_blobs(
    residual: &[f32],
    width: usize,
    height: usize,
    threshold: f32,
    min_area: usize,
) -> Vec<Blob> {
    let mask: Vec<bool> = residual.iter().map(|&v| v > threshold).collect();
    let (labels, count) = label_components(&mask, width, height);

    let mut blobs: Vec<Blob> = (0..count)
        .map(|_| Blob {
            pixels: Vec::new(),
            merged: false,
        })
        .collect();
    for (idx, &label) in labels.iter().enumerate() {
        if label > 0 {
            blobs[label as usize - 1].pixels.push(idx);
        }
    }

    blobs.retain(|b| b.pixels.len() >= min_area);
    blobs
}

/// Split a blob when, at some threshold between the detection level and its
/// peak, it breaks into two or more branches each holding at least
/// `contrast` of the blob's flux. Pixels are then assigned to the branch
/// whose peak is closest. Children are flagged as merged.
pub(crate) fn deblend(
    blob: Blob,
    residual: &[f32],
    width: usize,
    threshold: f32,
    params: DeblendParams,
) -> Vec<Blob> {
    if params.levels < 2 || blob.pixels.len() < 2 * params.min_area.max(1) {
        return vec![blob];
    }

    let peak = blob
        .pixels
        .iter()
        .map(|&i| residual[i])
        .fold(f32::NEG_INFINITY, f32::max);
    if peak <= threshold {
        return vec![blob];
    }
    let total_flux: f64 = blob.pixels.iter().map(|&i| residual[i].max(0.0) as f64).sum();

    let xs = blob.pixels.iter().map(|&i| i % width);
    let ys = blob.pixels.iter().map(|&i| i / width);
    let (x0, x1) = (xs.clone().min().unwrap_or(0), xs.max().unwrap_or(0));
    let (y0, y1) = (ys.clone().min().unwrap_or(0), ys.max().unwrap_or(0));
    let (bw, bh) = (x1 - x0 + 1, y1 - y0 + 1);
    let local = |i: usize| (i / width - y0) * bw + (i % width - x0);

    for level in 1..params.levels {
        let frac = level as f32 / params.levels as f32;
        let t = if threshold > 0.0 {
            threshold * (peak / threshold).powf(frac)
        } else {
            threshold + (peak - threshold) * frac
        };

        let mut mask = vec![false; bw * bh];
        for &i in &blob.pixels {
            if residual[i] > t {
                mask[local(i)] = true;
            }
        }
        let (labels, count) = label_components(&mask, bw, bh);
        if count < 2 {
            continue;
        }

        // Branch flux and brightest pixel per component.
        let mut flux = vec![0.0f64; count as usize];
        let mut seeds = vec![(usize::MAX, f32::NEG_INFINITY); count as usize];
        for &i in &blob.pixels {
            let label = labels[local(i)];
            if label == 0 {
                continue;
            }
            let k = label as usize - 1;
            flux[k] += residual[i] as f64;
            if residual[i] > seeds[k].1 {
                seeds[k] = (i, residual[i]);
            }
        }

        let significant: Vec<usize> = (0..count as usize)
            .filter(|&k| flux[k] >= params.contrast * total_flux)
            .map(|k| seeds[k].0)
            .collect();
        if significant.len() < 2 {
            continue;
        }

        let children = assign_to_seeds(&blob.pixels, &significant, width);
        if children.iter().filter(|c| c.len() >= params.min_area).count() < 2 {
            return vec![blob];
        }
        return merge_small_children(children, &significant, width, params.min_area);
    }

    vec![blob]
}

fn distance_sq(a: usize, b: usize, width: usize) -> usize {
    let dx = (a % width).abs_diff(b % width);
    let dy = (a / width).abs_diff(b / width);
    dx * dx + dy * dy
}

fn nearest_seed(pixel: usize, seeds: &[usize], width: usize, allowed: impl Fn(usize) -> bool) -> usize {
    (0..seeds.len())
        .filter(|&k| allowed(k))
        .min_by_key(|&k| (distance_sq(pixel, seeds[k], width), k))
        .unwrap_or(0)
}

fn assign_to_seeds(pixels: &[usize], seeds: &[usize], width: usize) -> Vec<Vec<usize>> {
    let mut children = vec![Vec::new(); seeds.len()];
    for &p in pixels {
        children[nearest_seed(p, seeds, width, |_| true)].push(p);
    }
    children
}

fn merge_small_children(
    children: Vec<Vec<usize>>,
    seeds: &[usize],
    width: usize,
    min_area: usize,
) -> Vec<Blob> {
    let keep: Vec<bool> = children.iter().map(|c| c.len() >= min_area).collect();
    let mut merged: Vec<Vec<usize>> = vec![Vec::new(); children.len()];
    for (k, pixels) in children.into_iter().enumerate() {
        if keep[k] {
            merged[k].extend(pixels);
        } else {
            let target = nearest_seed(seeds[k], seeds, width, |j| keep[j]);
            merged[target].extend(pixels);
        }
    }
    merged
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|pixels| Blob {
            pixels,
            merged: true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_components_eight_connectivity() {
        #[rustfmt::skip]
        let mask = vec![
            true,  false, false, false,
            false, true,  false, true,
            false, false, false, true,
        ];
        let (labels, count) = label_components(&mask, 4, 3);
        assert_eq!(count, 2);
        assert_eq!(labels[0], labels[5]);
        assert_eq!(labels[7], labels[11]);
        assert_ne!(labels[0], labels[7]);
    }

    #[test]
    fn test_label_components_u_shape_merges() {
        #[rustfmt::skip]
        let mask = vec![
            true,  false, true,
            true,  false, true,
            true,  true,  true,
        ];
        let (_, count) = label_components(&mask, 3, 3);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_extract_blobs_min_area() {
        let (w, h) = (10, 10);
        let mut residual = vec![0.0f32; w * h];
        for y in 2..5 {
            for x in 2..5 {
                residual[y * w + x] = 10.0;
            }
        }
        residual[8 * w + 8] = 10.0;

        let blobs = extract_blobs(&residual, w, h, 1.0, 4);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].pixels.len(), 9);
        assert!(!blobs[0].merged);
    }

    #[test]
    fn test_deblend_splits_two_peaks() {
        let (w, h) = (30, 12);
        let gauss = |x: f32, y: f32, cx: f32, cy: f32| {
            100.0 * (-((x - cx).powi(2) + (y - cy).powi(2)) / (2.0 * 1.5 * 1.5)).exp()
        };
        let residual: Vec<f32> = (0..w * h)
            .map(|i| {
                let (x, y) = ((i % w) as f32, (i / w) as f32);
                gauss(x, y, 10.0, 6.0) + gauss(x, y, 18.0, 6.0) + 2.0
            })
            .collect();

        let blobs = extract_blobs(&residual, w, h, 1.0, 5);
        assert_eq!(blobs.len(), 1);

        let params = DeblendParams {
            levels: 32,
            contrast: 0.005,
            min_area: 5,
        };
        let children = deblend(blobs[0].clone(), &residual, w, 1.0, params);
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.merged));
        let total: usize = children.iter().map(|c| c.pixels.len()).sum();
        assert_eq!(total, blobs[0].pixels.len());
    }

    #[test]
    fn test_deblend_keeps_single_peak() {
        let (w, h) = (15, 15);
        let residual: Vec<f32> = (0..w * h)
            .map(|i| {
                let (x, y) = ((i % w) as f32 - 7.0, (i / w) as f32 - 7.0);
                50.0 * (-(x * x + y * y) / 8.0).exp()
            })
            .collect();
        let blobs = extract_blobs(&residual, w, h, 1.0, 5);
        let params = DeblendParams {
            levels: 32,
            contrast: 0.005,
            min_area: 5,
        };
        let children = deblend(blobs[0].clone(), &residual, w, 1.0, params);
        assert_eq!(children.len(), 1);
        assert!(!children[0].merged);
    }
}
