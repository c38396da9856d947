//! Static k-d tree for nearest-neighbour lookups.

/// A point that can be stored in a [`KdTree`].
pub trait KdPoint: Copy {
    /// Number of dimensions.
    const DIM: usize;

    fn coord(&self, axis: usize) -> f64;

    fn distance_sq(&self, other: &Self) -> f64 {
        (0..Self::DIM)
            .map(|axis| {
                let d = self.coord(axis) - other.coord(axis);
                d * d
            })
            .sum()
    }
}

impl<const K: usize> KdPoint for [f64; K] {
    const DIM: usize = K;

    fn coord(&self, axis: usize) -> f64 {
        self[axis]
    }
}

#[derive(Debug, Clone)]
struct KdNode {
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    split_dim: usize,
}

/// Balanced k-d tree built once by median splits, queried many times.
#[derive(Debug, Clone)]
pub struct KdTree<P: KdPoint> {
    nodes: Vec<KdNode>,
    points: Vec<P>,
    root: Option<usize>,
}

impl<P: KdPoint> KdTree<P> {
    pub fn build(points: Vec<P>) -> Self {
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = Self::build_recursive(&points, &mut indices, 0, &mut nodes);
        Self {
            nodes,
            points,
            root,
        }
    }

    fn build_recursive(
        points: &[P],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % P::DIM;
        let median = indices.len() / 2;
        indices.select_nth_unstable_by(median, |&a, &b| {
            points[a]
                .coord(split_dim)
                .total_cmp(&points[b].coord(split_dim))
        });

        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, &mut right_part[1..], depth + 1, nodes);

        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Closest stored point to `query` as `(index, distance_squared)`.
    ///
    /// Equidistant candidates resolve to the lowest index, so results do not
    /// depend on tree layout.
    pub fn nearest(&self, query: &P) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        if let Some(root) = self.root {
            self.nearest_recursive(root, query, &mut best);
        }
        best
    }

    fn nearest_recursive(&self, node_idx: usize, query: &P, best: &mut Option<(usize, f64)>) {
        let node = &self.nodes[node_idx];
        let point = &self.points[node.point_idx];

        let d = point.distance_sq(query);
        let better = match *best {
            None => true,
            Some((idx, best_d)) => d < best_d || (d == best_d && node.point_idx < idx),
        };
        if better {
            *best = Some((node.point_idx, d));
        }

        let diff = query.coord(node.split_dim) - point.coord(node.split_dim);
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.nearest_recursive(near, query, best);
        }
        if let Some(far) = far {
            // `<=` keeps equidistant points on the far side reachable for the tie-break.
            let visit = match *best {
                Some((_, best_d)) => diff * diff <= best_d || best_d.is_nan(),
                None => true,
            };
            if visit {
                self.nearest_recursive(far, query, best);
            }
        }
    }
}
