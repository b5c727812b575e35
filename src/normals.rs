use log::{debug, warn};
use nalgebra as na;
use rayon::prelude::*;

use crate::{
    config::NormalConfig,
    error::{RegistrationError, Result, Stage},
    spatial_index::SpatialIndex,
};

/// Neighborhood size (query point included) below which no normal is fitted.
pub const MIN_NORMAL_NEIGHBORS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalStats {
    pub estimated: usize,
    pub undefined: usize,
}

/// Per-point normal from the smallest-eigenvalue eigenvector of the local covariance.
///
/// Normals are oriented away from the cloud centroid (`n . (p - c) >= 0`); a
/// point lying exactly on that plane keeps the eigen solver's sign. Points
/// with a degenerate neighborhood get a zero normal.
pub fn estimate_normals(
    points: &[na::Point3<f64>],
    config: &NormalConfig,
) -> Result<(Vec<na::Vector3<f64>>, NormalStats)> {
    if points.is_empty() {
        return Err(RegistrationError::invalid_input(
            Stage::Normals,
            "cannot estimate normals of an empty cloud",
        ));
    }
    let index = SpatialIndex::new(points, config.radius);
    let centroid = points
        .iter()
        .fold(na::Vector3::zeros(), |acc, p| acc + p.coords)
        / points.len() as f64;

    let normals: Vec<na::Vector3<f64>> = points
        .par_iter()
        .map(|pt| {
            let neighbors = index.radius_search(pt, config.radius, config.max_neighbors);
            if neighbors.len() < MIN_NORMAL_NEIGHBORS {
                return na::Vector3::zeros();
            }
            let neighborhood: Vec<na::Vector3<f64>> = neighbors
                .iter()
                .map(|n| points[n.index].coords)
                .collect();
            match fit_normal(&neighborhood) {
                Some(normal) if normal.dot(&(pt.coords - centroid)) < 0.0 => -normal,
                Some(normal) => normal,
                None => na::Vector3::zeros(),
            }
        })
        .collect();

    let undefined = normals.iter().filter(|n| n.norm_squared() == 0.0).count();
    let stats = NormalStats {
        estimated: normals.len() - undefined,
        undefined,
    };
    if stats.estimated == 0 {
        return Err(RegistrationError::insufficient_geometry(
            Stage::Normals,
            format!(
                "no point has {} neighbors within radius {} (max_neighbors {}, {} points)",
                MIN_NORMAL_NEIGHBORS,
                config.radius,
                config.max_neighbors,
                points.len()
            ),
        ));
    }
    if stats.undefined > 0 {
        warn!(
            "{} of {} points have too few neighbors for a normal (radius {})",
            stats.undefined,
            points.len(),
            config.radius
        );
    }
    debug!("estimated {} normals", stats.estimated);
    Ok((normals, stats))
}

fn fit_normal(neighborhood: &[na::Vector3<f64>]) -> Option<na::Vector3<f64>> {
    let n = neighborhood.len() as f64;
    let mean = neighborhood
        .iter()
        .fold(na::Vector3::zeros(), |acc, p| acc + p)
        / n;
    let covariance = neighborhood
        .iter()
        .fold(na::Matrix3::<f64>::zeros(), |acc, p| {
            let d = p - mean;
            acc + d * d.transpose()
        })
        / n;
    if covariance.trace() <= f64::EPSILON * mean.norm_squared().max(1.0) {
        // coincident points
        return None;
    }
    let eigen = na::SymmetricEigen::new(covariance);
    let smallest = eigen.eigenvalues.imin();
    eigen.eigenvectors.column(smallest).into_owned().try_normalize(1e-12)
}
