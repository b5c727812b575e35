//! Fast Point Feature Histograms.
//!
//! Each descriptor concatenates three 11-bin histograms of the Darboux-frame
//! angles between a point and its neighbors. A point's own histogram (SPFH)
//! is blended with its neighbors' histograms weighted by inverse squared
//! distance.

use log::{debug, warn};
use nalgebra as na;
use rayon::prelude::*;
use std::f64::consts::PI;

use crate::{
    config::FeatureConfig,
    error::{RegistrationError, Result, Stage},
    point_cloud::PointCloud,
    spatial_index::{Neighbor, SpatialIndex},
};

pub const FPFH_BINS_PER_FEATURE: usize = 11;
pub const FPFH_DIM: usize = 3 * FPFH_BINS_PER_FEATURE;

pub type Histogram = [f64; FPFH_DIM];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fpfh(pub Histogram);

impl Fpfh {
    #[inline]
    pub fn squared_distance(&self, other: &Fpfh) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Descriptors index-aligned with the cloud they were computed on; `None` marks an invalid point.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub descriptors: Vec<Option<Fpfh>>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_some()).count()
    }

    pub fn get(&self, i: usize) -> Option<&Fpfh> {
        self.descriptors.get(i).and_then(|d| d.as_ref())
    }
}

pub fn compute_fpfh(cloud: &PointCloud, config: &FeatureConfig) -> Result<FeatureSet> {
    config.validate()?;
    let Some(normals) = cloud.normals() else {
        return Err(RegistrationError::insufficient_geometry(
            Stage::Features,
            "normals must be estimated before features",
        ));
    };
    let points = cloud.points();
    let index = SpatialIndex::new(points, config.radius);

    let neighborhoods: Vec<Vec<Neighbor>> = points
        .par_iter()
        .map(|pt| index.radius_search(pt, config.radius, config.max_neighbors))
        .collect();

    let spfh: Vec<Option<Histogram>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            if !cloud.has_valid_normal(i) {
                return None;
            }
            compute_spfh(i, &neighborhoods[i], points, normals)
        })
        .collect();

    let descriptors: Vec<Option<Fpfh>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let own = spfh[i]?;
            Some(Fpfh(weight_with_neighbors(i, &own, &neighborhoods[i], &spfh)))
        })
        .collect();

    let features = FeatureSet { descriptors };
    let valid = features.valid_count();
    if valid == 0 {
        return Err(RegistrationError::insufficient_geometry(
            Stage::Features,
            format!(
                "no valid descriptor for {} points (radius {}, max_neighbors {})",
                points.len(),
                config.radius,
                config.max_neighbors
            ),
        ));
    }
    if valid < features.len() {
        warn!(
            "{} of {} points have no FPFH descriptor",
            features.len() - valid,
            features.len()
        );
    }
    debug!("computed {} FPFH descriptors", valid);
    Ok(features)
}

fn compute_spfh(
    i: usize,
    neighbors: &[Neighbor],
    points: &[na::Point3<f64>],
    normals: &[na::Vector3<f64>],
) -> Option<Histogram> {
    let pairs: Vec<[f64; 3]> = neighbors
        .iter()
        .filter(|n| n.index != i && normals[n.index].norm_squared() > 0.0)
        .filter_map(|n| {
            pair_features(
                &points[i],
                &normals[i],
                &points[n.index],
                &normals[n.index],
            )
        })
        .collect();
    if pairs.is_empty() {
        return None;
    }

    let increment = 100.0 / pairs.len() as f64;
    let mut histogram = [0.0; FPFH_DIM];
    for [f1, f2, f3] in pairs {
        histogram[bin(f1, -PI, PI)] += increment;
        histogram[FPFH_BINS_PER_FEATURE + bin(f2, -1.0, 1.0)] += increment;
        histogram[2 * FPFH_BINS_PER_FEATURE + bin(f3, -1.0, 1.0)] += increment;
    }
    Some(histogram)
}

#[inline]
fn bin(value: f64, min: f64, max: f64) -> usize {
    let b = (FPFH_BINS_PER_FEATURE as f64 * (value - min) / (max - min)).floor();
    b.clamp(0.0, (FPFH_BINS_PER_FEATURE - 1) as f64) as usize
}

/// Darboux-frame angles (f1, f2, f3) of a point pair, or `None` when the pair is degenerate.
fn pair_features(
    p1: &na::Point3<f64>,
    n1: &na::Vector3<f64>,
    p2: &na::Point3<f64>,
    n2: &na::Vector3<f64>,
) -> Option<[f64; 3]> {
    let mut dp = p2 - p1;
    let distance = dp.norm();
    if distance == 0.0 {
        return None;
    }
    let angle1 = n1.dot(&dp) / distance;
    let angle2 = n2.dot(&dp) / distance;

    // the source of the frame is the point whose normal is closer to the connecting line
    let (u, n_other, f3) = if angle1.abs().acos() > angle2.abs().acos() {
        dp = -dp;
        (n2, n1, -angle2)
    } else {
        (n1, n2, angle1)
    };

    let v = dp.cross(u).try_normalize(0.0)?;
    let w = u.cross(&v);
    let f2 = v.dot(n_other);
    let f1 = w.dot(n_other).atan2(u.dot(n_other));
    Some([f1, f2, f3])
}

fn weight_with_neighbors(
    i: usize,
    own: &Histogram,
    neighbors: &[Neighbor],
    spfh: &[Option<Histogram>],
) -> Histogram {
    let mut weighted = [0.0; FPFH_DIM];
    let mut block_sums = [0.0; 3];
    for neighbor in neighbors.iter().filter(|n| n.index != i) {
        let distance2 = neighbor.distance * neighbor.distance;
        if distance2 == 0.0 {
            continue;
        }
        let Some(histogram) = &spfh[neighbor.index] else {
            continue;
        };
        for (j, value) in histogram.iter().enumerate() {
            let v = value / distance2;
            block_sums[j / FPFH_BINS_PER_FEATURE] += v;
            weighted[j] += v;
        }
    }

    let mut fpfh = *own;
    for (j, value) in weighted.iter().enumerate() {
        let block_sum = block_sums[j / FPFH_BINS_PER_FEATURE];
        if block_sum > 0.0 {
            fpfh[j] += value * 100.0 / block_sum;
        }
    }
    fpfh
}
