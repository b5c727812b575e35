use nalgebra as na;
use rayon::prelude::*;

use crate::{spatial_index::SpatialIndex, transform::RigidTransform};

/// Pairing of a source index with a target index.
///
/// `distance` is Euclidean for point pairs and descriptor distance for feature matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub source: usize,
    pub target: usize,
    pub distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Evaluation {
    /// Inliers over source points.
    pub fitness: f64,
    pub inlier_rmse: f64,
    pub inlier_count: usize,
}

pub fn transform_points(
    transform: &RigidTransform,
    points: &[na::Point3<f64>],
) -> Vec<na::Point3<f64>> {
    points
        .par_iter()
        .map(|pt| transform.transform_point(pt))
        .collect()
}

/// Closest target point for every source point, dropping pairs farther than `max_correspondence_distance`.
pub fn point_association(
    points: &[na::Point3<f64>],
    target_index: &SpatialIndex,
    max_correspondence_distance: f64,
) -> Vec<Correspondence> {
    points
        .par_iter()
        .enumerate()
        .filter_map(|(i, pt)| {
            target_index
                .nearest(pt, max_correspondence_distance)
                .map(|neighbor| Correspondence {
                    source: i,
                    target: neighbor.index,
                    distance: neighbor.distance,
                })
        })
        .collect()
}

/// Fitness and RMSE of a correspondence set; summation order is fixed so results are reproducible.
pub fn evaluate(correspondences: &[Correspondence], source_len: usize) -> Evaluation {
    if correspondences.is_empty() || source_len == 0 {
        return Evaluation::default();
    }
    let squared_error: f64 = correspondences
        .iter()
        .map(|c| c.distance * c.distance)
        .sum();
    let inlier_count = correspondences.len();
    Evaluation {
        fitness: inlier_count as f64 / source_len as f64,
        inlier_rmse: (squared_error / inlier_count as f64).sqrt(),
        inlier_count,
    }
}

/// Scores `transform` by associating every transformed source point with the target.
pub fn evaluate_registration(
    source: &[na::Point3<f64>],
    target_index: &SpatialIndex,
    transform: &RigidTransform,
    max_correspondence_distance: f64,
) -> Evaluation {
    let moved = transform_points(transform, source);
    let correspondences = point_association(&moved, target_index, max_correspondence_distance);
    evaluate(&correspondences, source.len())
}
