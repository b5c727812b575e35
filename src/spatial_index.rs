//! Voxel hash grid for neighbor queries over a fixed point set.
//!
//! The index borrows its points, so the cloud cannot change while the index
//! is alive; a modified cloud needs a freshly built index. All queries are
//! exact and return neighbors sorted by ascending distance (ties by index).

use nalgebra as na;
use std::collections::HashMap;

use crate::voxel_util::{point_to_voxel, Voxel};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

pub struct SpatialIndex<'a> {
    points: &'a [na::Point3<f64>],
    cell_size: f64,
    map: HashMap<Voxel, Vec<usize>>,
    min_voxel: Voxel,
    max_voxel: Voxel,
}

impl<'a> SpatialIndex<'a> {
    /// `cell_size` should be close to the typical query radius.
    pub fn new(points: &'a [na::Point3<f64>], cell_size: f64) -> SpatialIndex<'a> {
        let cell_size = if cell_size > 0.0 && cell_size.is_finite() {
            cell_size
        } else {
            1.0
        };
        let mut map: HashMap<Voxel, Vec<usize>> = HashMap::new();
        let mut min_voxel = Voxel::repeat(i64::MAX);
        let mut max_voxel = Voxel::repeat(i64::MIN);
        for (i, pt) in points.iter().enumerate() {
            let voxel = point_to_voxel(pt, cell_size);
            min_voxel = component_min(&min_voxel, &voxel);
            max_voxel = component_max(&max_voxel, &voxel);
            map.entry(voxel).or_default().push(i);
        }
        SpatialIndex {
            points,
            cell_size,
            map,
            min_voxel,
            max_voxel,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &'a [na::Point3<f64>] {
        self.points
    }

    /// Up to `max_neighbors` points within `radius` of `query` (the query point itself included).
    pub fn radius_search(
        &self,
        query: &na::Point3<f64>,
        radius: f64,
        max_neighbors: usize,
    ) -> Vec<Neighbor> {
        let radius2 = radius * radius;
        let mut neighbors = Vec::new();
        self.visit_box(
            &point_to_voxel(&(query - na::Vector3::repeat(radius)), self.cell_size),
            &point_to_voxel(&(query + na::Vector3::repeat(radius)), self.cell_size),
            |i| {
                let d2 = (self.points[i] - query).norm_squared();
                if d2 <= radius2 {
                    neighbors.push(Neighbor {
                        index: i,
                        distance: d2.sqrt(),
                    });
                }
            },
        );
        sort_neighbors(&mut neighbors);
        neighbors.truncate(max_neighbors);
        neighbors
    }

    /// The `k` closest points to `query`.
    pub fn knn_search(&self, query: &na::Point3<f64>, k: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        let center = point_to_voxel(query, self.cell_size);
        // cells closer than the occupied bounding box are all empty
        let gap = (0..3)
            .map(|axis| {
                (self.min_voxel[axis] - center[axis])
                    .max(center[axis] - self.max_voxel[axis])
                    .max(0)
            })
            .max()
            .unwrap_or(0);
        let mut reach = gap.max(1);
        loop {
            let lo = center - Voxel::repeat(reach);
            let hi = center + Voxel::repeat(reach);
            let mut candidates = Vec::new();
            self.visit_box(&lo, &hi, |i| {
                candidates.push(Neighbor {
                    index: i,
                    distance: (self.points[i] - query).norm(),
                });
            });
            sort_neighbors(&mut candidates);

            let covers_all = voxel_in_box(&self.min_voxel, &lo, &hi)
                && voxel_in_box(&self.max_voxel, &lo, &hi);
            // anything outside the box is farther than (reach * cell_size)
            let complete = candidates.len() >= k
                && candidates[k - 1].distance <= reach as f64 * self.cell_size;
            if covers_all || complete {
                candidates.truncate(k);
                return candidates;
            }
            reach = reach.saturating_mul(2);
        }
    }

    /// Closest point within `max_distance`, if any.
    pub fn nearest(&self, query: &na::Point3<f64>, max_distance: f64) -> Option<Neighbor> {
        let max_distance2 = max_distance * max_distance;
        let mut best: Option<(f64, usize)> = None;
        self.visit_box(
            &point_to_voxel(&(query - na::Vector3::repeat(max_distance)), self.cell_size),
            &point_to_voxel(&(query + na::Vector3::repeat(max_distance)), self.cell_size),
            |i| {
                let d2 = (self.points[i] - query).norm_squared();
                if d2 > max_distance2 {
                    return;
                }
                let better = match best {
                    None => true,
                    Some((best_d2, best_i)) => d2 < best_d2 || (d2 == best_d2 && i < best_i),
                };
                if better {
                    best = Some((d2, i));
                }
            },
        );
        best.map(|(d2, index)| Neighbor {
            index,
            distance: d2.sqrt(),
        })
    }

    fn visit_box(&self, lo: &Voxel, hi: &Voxel, mut visit: impl FnMut(usize)) {
        if self.is_empty() {
            return;
        }
        let lo = component_max(lo, &self.min_voxel);
        let hi = component_min(hi, &self.max_voxel);
        if lo.x > hi.x || lo.y > hi.y || lo.z > hi.z {
            return;
        }
        let extent = hi - lo + Voxel::repeat(1);
        let box_cells = (extent.x as u128) * (extent.y as u128) * (extent.z as u128);

        if box_cells > self.map.len() as u128 {
            // sparse occupancy: cheaper to walk the occupied cells
            for (voxel, indices) in &self.map {
                if voxel_in_box(voxel, &lo, &hi) {
                    indices.iter().for_each(|&i| visit(i));
                }
            }
        } else {
            for x in lo.x..=hi.x {
                for y in lo.y..=hi.y {
                    for z in lo.z..=hi.z {
                        if let Some(indices) = self.map.get(&Voxel::new(x, y, z)) {
                            indices.iter().for_each(|&i| visit(i));
                        }
                    }
                }
            }
        }
    }
}

fn component_min(a: &Voxel, b: &Voxel) -> Voxel {
    Voxel::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z))
}

fn component_max(a: &Voxel, b: &Voxel) -> Voxel {
    Voxel::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z))
}

fn voxel_in_box(voxel: &Voxel, lo: &Voxel, hi: &Voxel) -> bool {
    (0..3).all(|axis| voxel[axis] >= lo[axis] && voxel[axis] <= hi[axis])
}

fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.index.cmp(&b.index))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_points(n: usize, seed: u64) -> Vec<na::Point3<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                na::Point3::new(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-0.5..0.5),
                )
            })
            .collect()
    }

    fn brute_force(points: &[na::Point3<f64>], query: &na::Point3<f64>) -> Vec<Neighbor> {
        let mut all: Vec<Neighbor> = points
            .iter()
            .enumerate()
            .map(|(index, p)| Neighbor {
                index,
                distance: (p - query).norm(),
            })
            .collect();
        sort_neighbors(&mut all);
        all
    }

    #[test]
    fn radius_search_matches_brute_force() {
        let points = random_points(2000, 7);
        let index = SpatialIndex::new(&points, 0.1);
        let query = na::Point3::new(0.1, -0.2, 0.05);
        let expected: Vec<usize> = brute_force(&points, &query)
            .into_iter()
            .filter(|n| n.distance <= 0.15)
            .map(|n| n.index)
            .collect();
        let found: Vec<usize> = index
            .radius_search(&query, 0.15, usize::MAX)
            .into_iter()
            .map(|n| n.index)
            .collect();
        assert_eq!(found, expected);

        let capped = index.radius_search(&query, 0.15, 5);
        assert_eq!(capped.len(), 5.min(expected.len()));
    }

    #[test]
    fn knn_matches_brute_force_inside_and_outside() {
        let points = random_points(1500, 11);
        let index = SpatialIndex::new(&points, 0.05);
        for query in [
            na::Point3::new(0.0, 0.0, 0.0),
            na::Point3::new(5.0, -3.0, 2.0),
        ] {
            let expected: Vec<usize> = brute_force(&points, &query)
                .into_iter()
                .take(12)
                .map(|n| n.index)
                .collect();
            let found: Vec<usize> = index
                .knn_search(&query, 12)
                .into_iter()
                .map(|n| n.index)
                .collect();
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn knn_larger_than_cloud_returns_everything() {
        let points = random_points(10, 3);
        let index = SpatialIndex::new(&points, 0.5);
        assert_eq!(index.knn_search(&na::Point3::origin(), 50).len(), 10);
    }

    #[test]
    fn nearest_respects_max_distance() {
        let points = vec![na::Point3::new(0.0, 0.0, 0.0), na::Point3::new(1.0, 0.0, 0.0)];
        let index = SpatialIndex::new(&points, 0.1);
        let hit = index.nearest(&na::Point3::new(0.9, 0.0, 0.0), 0.2).unwrap();
        assert_eq!(hit.index, 1);
        assert!((hit.distance - 0.1).abs() < 1e-12);
        assert!(index.nearest(&na::Point3::new(0.5, 0.0, 0.0), 0.2).is_none());
    }

    #[test]
    fn empty_index_answers_nothing() {
        let points: Vec<na::Point3<f64>> = Vec::new();
        let index = SpatialIndex::new(&points, 0.1);
        assert!(index.knn_search(&na::Point3::origin(), 3).is_empty());
        assert!(index.radius_search(&na::Point3::origin(), 1.0, 10).is_empty());
        assert!(index.nearest(&na::Point3::origin(), 1.0).is_none());
    }
}
