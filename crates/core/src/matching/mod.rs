//! Nearest-neighbour matching between two coordinate sets.
//!
//! The same primitive serves pixel-space reconciliation (detector output
//! against the calibration reference list) and sky-space catalog matching.
//! A pair matches only when its distance is strictly less than the radius.

mod kdtree;

pub use kdtree::{KdPoint, KdTree};

use serde::{Deserialize, Serialize};

use crate::sky::{arcsec_from_chord, SkyPosition};

/// Coordinate space a matcher operates in.
pub trait MatchSpace {
    type Position;
    type Embedded: KdPoint;

    /// Map a position into the space the k-d tree indexes.
    fn embed(position: &Self::Position) -> Self::Embedded;

    /// Convert a squared distance between embedded points into the distance
    /// unit the match radius is expressed in.
    fn distance(embedded_distance_sq: f64) -> f64;
}

/// Euclidean pixel space; distances in pixels.
#[derive(Debug, Clone, Copy)]
pub struct PixelSpace;

impl MatchSpace for PixelSpace {
    type Position = [f64; 2];
    type Embedded = [f64; 2];

    fn embed(position: &[f64; 2]) -> [f64; 2] {
        *position
    }

    fn distance(embedded_distance_sq: f64) -> f64 {
        embedded_distance_sq.sqrt()
    }
}

/// Celestial sphere; distances are great-circle arcseconds.
///
/// Positions are indexed as unit vectors. Chord length grows monotonically
/// with angular separation, so the nearest chord is the nearest on the sky.
#[derive(Debug, Clone, Copy)]
pub struct SkySpace;

impl MatchSpace for SkySpace {
    type Position = SkyPosition;
    type Embedded = [f64; 3];

    fn embed(position: &SkyPosition) -> [f64; 3] {
        position.unit_vector()
    }

    fn distance(embedded_distance_sq: f64) -> f64 {
        arcsec_from_chord(embedded_distance_sq.sqrt())
    }
}

/// One element of `set_a` paired with its closest element of `set_b`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub a_index: usize,
    pub b_index: usize,
    pub distance: f64,
}

/// Partition of `set_a` into matched and unmatched indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchPartition {
    pub matched: Vec<Match>,
    pub unmatched: Vec<usize>,
}

impl MatchPartition {
    pub fn matched_len(&self) -> usize {
        self.matched.len()
    }

    pub fn unmatched_len(&self) -> usize {
        self.unmatched.len()
    }
}

/// Match every element of `set_a` against its nearest neighbour in `set_b`.
///
/// The index over `set_b` is built once per call. Several `a` elements may
/// share the same `b` partner. Both output lists are in `set_a` order.
pub fn match_nearest<S: MatchSpace>(
    set_a: &[S::Position],
    set_b: &[S::Position],
    radius: f64,
) -> MatchPartition {
    let tree = KdTree::build(set_b.iter().map(S::embed).collect());
    let mut partition = MatchPartition::default();

    for (a_index, position) in set_a.iter().enumerate() {
        let nearest = tree
            .nearest(&S::embed(position))
            .map(|(b_index, d_sq)| (b_index, S::distance(d_sq)));

        match nearest {
            Some((b_index, distance)) if distance < radius => partition.matched.push(Match {
                a_index,
                b_index,
                distance,
            }),
            _ => partition.unmatched.push(a_index),
        }
    }

    partition
}

/// [`match_nearest`] in pixel space.
pub fn match_pixels(set_a: &[[f64; 2]], set_b: &[[f64; 2]], radius_px: f64) -> MatchPartition {
    match_nearest::<PixelSpace>(set_a, set_b, radius_px)
}

/// [`match_nearest`] on the sky with an arcsecond radius.
pub fn match_sky(
    set_a: &[SkyPosition],
    set_b: &[SkyPosition],
    radius_arcsec: f64,
) -> MatchPartition {
    match_nearest::<SkySpace>(set_a, set_b, radius_arcsec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_radius_is_unmatched() {
        // 3-4-5 triangle gives an exact distance of 5.0
        let p = match_pixels(&[[0.0, 0.0]], &[[3.0, 4.0]], 5.0);
        assert!(p.matched.is_empty());
        assert_eq!(p.unmatched, vec![0]);
    }

    #[test]
    fn test_just_inside_radius_is_matched() {
        let p = match_pixels(&[[0.0, 0.0]], &[[3.0, 4.0]], 5.0 + 1e-9);
        assert_eq!(p.matched.len(), 1);
        assert_eq!(p.matched[0].distance, 5.0);

        let p = match_pixels(&[[0.0, 0.0]], &[[3.0, 4.0 - 1e-6]], 5.0);
        assert_eq!(p.matched.len(), 1);
    }

    #[test]
    fn test_picks_closest_not_first() {
        let b = [[4.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        let p = match_pixels(&[[0.0, 0.0]], &b, 10.0);
        assert_eq!(p.matched[0].b_index, 1);
        assert_eq!(p.matched[0].distance, 1.0);
    }

    #[test]
    fn test_empty_sets() {
        let p = match_pixels(&[[1.0, 1.0], [2.0, 2.0]], &[], 5.0);
        assert_eq!(p.unmatched, vec![0, 1]);

        let p = match_pixels(&[], &[[1.0, 1.0]], 5.0);
        assert_eq!(p, MatchPartition::default());
    }

    #[test]
    fn test_matching_is_idempotent() {
        let a: Vec<[f64; 2]> = (0..40).map(|i| [i as f64 * 2.5, (i % 7) as f64]).collect();
        let b: Vec<[f64; 2]> = (0..30).map(|i| [i as f64 * 3.1, (i % 5) as f64]).collect();
        let first = match_pixels(&a, &b, 1.5);
        let second = match_pixels(&a, &b, 1.5);
        assert_eq!(first, second);
        assert_eq!(first.matched_len() + first.unmatched_len(), a.len());
    }

    #[test]
    fn test_sky_match_in_arcsec() {
        let center = SkyPosition::new(83.633, 22.0145);
        let near = SkyPosition::new(83.633, 22.0145 + 10.0 / 3600.0);
        let far = SkyPosition::new(83.633, 22.0145 + 20.0 / 3600.0);

        let p = match_sky(&[center], &[far, near], 15.0);
        assert_eq!(p.matched.len(), 1);
        assert_eq!(p.matched[0].b_index, 1);
        assert!((p.matched[0].distance - 10.0).abs() < 1e-6);

        let p = match_sky(&[center], &[far], 15.0);
        assert_eq!(p.unmatched, vec![0]);
    }
}
