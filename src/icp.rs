use log::{debug, warn};
use nalgebra as na;
use rayon::prelude::*;

use crate::{
    config::{EstimationMethod, IcpConfig},
    correspondence::{evaluate, point_association, transform_points, Correspondence, Evaluation},
    error::{RegistrationError, Result, Stage},
    lie_group::{Exp, Hat},
    point_cloud::PointCloud,
    spatial_index::SpatialIndex,
    transform::{estimate_rigid_transform, RigidTransform},
};

#[derive(Debug, Clone, PartialEq)]
pub struct IcpResult {
    pub transform: RigidTransform,
    pub fitness: f64,
    pub inlier_rmse: f64,
    pub inlier_count: usize,
    pub iterations: usize,
    pub converged: bool,
}

impl IcpResult {
    fn from_evaluation(
        transform: RigidTransform,
        evaluation: &Evaluation,
        iterations: usize,
        converged: bool,
    ) -> IcpResult {
        IcpResult {
            transform,
            fitness: evaluation.fitness,
            inlier_rmse: evaluation.inlier_rmse,
            inlier_count: evaluation.inlier_count,
            iterations,
            converged,
        }
    }
}

fn build_linear_system(
    correspondences: &[Correspondence],
    source: &[na::Point3<f64>],
    target: &[na::Point3<f64>],
    target_normals: &[na::Vector3<f64>],
) -> (na::Matrix6<f64>, na::Vector6<f64>) {
    let compute_jacobian_and_residual =
        |(source, target, normal): (&na::Vector3<f64>, &na::Vector3<f64>, &na::Vector3<f64>)| {
            let residual = normal.dot(&(source - target));

            // [trans 3, rotation 3]
            let mut j_p = na::Matrix3x6::identity();
            j_p.fixed_columns_mut::<3>(3)
                .copy_from(&(-1.0 * source.hat()));
            (normal.transpose() * j_p, residual)
        };

    correspondences
        .par_iter()
        .filter(|c| target_normals[c.target].norm_squared() > 0.0)
        .map(|c| {
            let (j_r, residual) = compute_jacobian_and_residual((
                &source[c.source].coords,
                &target[c.target].coords,
                &target_normals[c.target],
            ));
            let j_t = j_r.transpose();
            (j_t * j_r, j_t * residual)
        })
        .reduce(Default::default, |(j_tj_a, j_tr_a), (j_tj_b, j_tr_b)| {
            (j_tj_a + j_tj_b, j_tr_a + j_tr_b)
        })
}

/// Rigid increment that moves the (already transformed) source onto the target.
fn estimate_increment(
    method: EstimationMethod,
    correspondences: &[Correspondence],
    source: &[na::Point3<f64>],
    target: &PointCloud,
) -> Result<RigidTransform> {
    match method {
        EstimationMethod::PointToPoint => {
            let (from, to): (Vec<na::Point3<f64>>, Vec<na::Point3<f64>>) = correspondences
                .iter()
                .map(|c| (source[c.source], target.points()[c.target]))
                .unzip();
            estimate_rigid_transform(&from, &to)
        }
        EstimationMethod::PointToPlane => {
            let normals = target.normals().unwrap_or(&[]);
            let (jtj, jtr) = build_linear_system(correspondences, source, target.points(), normals);
            let dx = jtj.qr().solve(&(-jtr)).ok_or_else(|| {
                RegistrationError::DegenerateTransform(format!(
                    "point-to-plane system is singular with {} correspondences",
                    correspondences.len()
                ))
            })?;
            Ok(RigidTransform::from_isometry(dx.exp()))
        }
    }
}

/// One ICP call from `initial_guess`.
///
/// Returns the initial guess with zeroed diagnostics when no source point has
/// a target within `max_correspondence_distance`.
pub fn align(
    source: &PointCloud,
    target: &PointCloud,
    target_index: &SpatialIndex,
    initial_guess: &RigidTransform,
    config: &IcpConfig,
) -> Result<IcpResult> {
    config.validate()?;
    if config.method == EstimationMethod::PointToPlane && !target.has_normals() {
        return Err(RegistrationError::invalid_input(
            Stage::FineAlignment,
            "point-to-plane ICP needs target normals",
        ));
    }

    let mut transform = *initial_guess;
    let mut moved = transform_points(&transform, source.points());
    let mut correspondences =
        point_association(&moved, target_index, config.max_correspondence_distance);
    if correspondences.is_empty() {
        warn!(
            "ICP found no correspondence within {}",
            config.max_correspondence_distance
        );
        return Ok(IcpResult::from_evaluation(
            transform,
            &Evaluation::default(),
            0,
            false,
        ));
    }
    let mut evaluation = evaluate(&correspondences, source.len());

    let mut converged = false;
    let mut iterations = 0;
    while iterations < config.max_iterations {
        let increment =
            match estimate_increment(config.method, &correspondences, &moved, target) {
                Ok(increment) => increment,
                Err(e) => {
                    // keep the last good transform
                    warn!("ICP stopped at iteration {}: {}", iterations, e);
                    break;
                }
            };
        let candidate = increment * transform;
        let candidate_moved = transform_points(&candidate, source.points());
        let candidate_correspondences = point_association(
            &candidate_moved,
            target_index,
            config.max_correspondence_distance,
        );
        if candidate_correspondences.is_empty() {
            warn!("ICP lost every correspondence at iteration {}", iterations);
            break;
        }
        let candidate_evaluation = evaluate(&candidate_correspondences, source.len());
        iterations += 1;

        converged = (candidate_evaluation.fitness - evaluation.fitness).abs()
            < config.relative_fitness
            && (candidate_evaluation.inlier_rmse - evaluation.inlier_rmse).abs()
                < config.relative_rmse;

        transform = candidate;
        moved = candidate_moved;
        correspondences = candidate_correspondences;
        evaluation = candidate_evaluation;
        if converged {
            break;
        }
    }
    if !converged {
        debug!("ICP did not converge within {} iterations", iterations);
    }
    Ok(IcpResult::from_evaluation(
        transform,
        &evaluation,
        iterations,
        converged,
    ))
}

/// Runs `passes` ICP calls, each seeded with the previous result.
///
/// The last pass is returned unless `keep_best_pass` asks for the pass with
/// the highest fitness (lowest RMSE on ties).
pub fn refine(
    source: &PointCloud,
    target: &PointCloud,
    initial_guess: &RigidTransform,
    config: &IcpConfig,
    passes: usize,
    keep_best_pass: bool,
) -> Result<IcpResult> {
    config.validate()?;
    if passes == 0 {
        return Err(RegistrationError::invalid_input(
            Stage::FineAlignment,
            "refinement_passes must be positive",
        ));
    }
    let target_index = SpatialIndex::new(target.points(), config.max_correspondence_distance);
    let mut current = IcpResult::from_evaluation(*initial_guess, &Evaluation::default(), 0, false);
    let mut best: Option<IcpResult> = None;

    for pass in 0..passes {
        current = align(source, target, &target_index, &current.transform, config)?;
        debug!(
            "ICP pass {}: fitness {:.4}, rmse {:.6}, {} iterations",
            pass, current.fitness, current.inlier_rmse, current.iterations
        );
        if keep_best_pass {
            let improves = best.as_ref().map_or(true, |b| {
                current.fitness > b.fitness
                    || (current.fitness == b.fitness && current.inlier_rmse < b.inlier_rmse)
            });
            if improves {
                best = Some(current.clone());
            }
        }
    }
    Ok(best.unwrap_or(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalConfig;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_cloud(n: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        PointCloud::from_points(
            (0..n)
                .map(|_| {
                    na::Point3::new(
                        rng.random_range(-0.5..0.5),
                        rng.random_range(-0.5..0.5),
                        rng.random_range(-0.5..0.5),
                    )
                })
                .collect(),
        )
    }

    fn small_offset() -> RigidTransform {
        RigidTransform::from_isometry(na::Isometry3::new(
            na::Vector3::new(0.002, -0.001, 0.0015),
            na::Vector3::new(0.0, 0.0, 0.5f64.to_radians()),
        ))
    }

    fn config(method: EstimationMethod) -> IcpConfig {
        IcpConfig {
            max_correspondence_distance: 0.05,
            max_iterations: 100,
            relative_fitness: 1e-9,
            relative_rmse: 1e-9,
            method,
        }
    }

    #[test]
    fn point_to_point_recovers_small_offset() {
        let target = random_cloud(1000, 21);
        let offset = small_offset();
        let source = target.transformed(&offset.inverse());
        let index = SpatialIndex::new(target.points(), 0.05);
        let result = align(
            &source,
            &target,
            &index,
            &RigidTransform::identity(),
            &config(EstimationMethod::PointToPoint),
        )
        .unwrap();
        assert!(result.inlier_rmse < 1e-4, "rmse {}", result.inlier_rmse);
        assert!((result.fitness - 1.0).abs() < 1e-12);
        assert!((result.transform.to_matrix() - offset.to_matrix()).amax() < 1e-6);
    }

    #[test]
    fn point_to_plane_recovers_small_offset() {
        let mut target = random_cloud(1000, 22);
        target
            .estimate_normals(&NormalConfig {
                radius: 0.15,
                max_neighbors: 30,
            })
            .unwrap();
        let offset = small_offset();
        let source = target.transformed(&offset.inverse());
        let index = SpatialIndex::new(target.points(), 0.05);
        let result = align(
            &source,
            &target,
            &index,
            &RigidTransform::identity(),
            &config(EstimationMethod::PointToPlane),
        )
        .unwrap();
        assert!(result.inlier_rmse < 1e-4, "rmse {}", result.inlier_rmse);
    }

    #[test]
    fn point_to_plane_without_normals_is_rejected() {
        let target = random_cloud(10, 23);
        let index = SpatialIndex::new(target.points(), 0.05);
        let err = align(
            &target,
            &target,
            &index,
            &RigidTransform::identity(),
            &config(EstimationMethod::PointToPlane),
        )
        .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidInput { .. }));
    }

    #[test]
    fn no_correspondence_returns_initial_guess() {
        let target = random_cloud(100, 24);
        let far = RigidTransform::from_isometry(na::Isometry3::translation(100.0, 0.0, 0.0));
        let index = SpatialIndex::new(target.points(), 0.05);
        let result = align(
            &target,
            &target,
            &index,
            &far,
            &config(EstimationMethod::PointToPoint),
        )
        .unwrap();
        assert_eq!(result.transform, far);
        assert_eq!(result.fitness, 0.0);
        assert_eq!(result.inlier_rmse, 0.0);
        assert_eq!(result.inlier_count, 0);
    }

    #[test]
    fn refinement_output_is_orthonormal() {
        let target = random_cloud(800, 25);
        let source = target.transformed(&small_offset().inverse());
        let result = refine(
            &source,
            &target,
            &RigidTransform::identity(),
            &config(EstimationMethod::PointToPoint),
            5,
            true,
        )
        .unwrap();
        let r = result.transform.rotation_matrix();
        assert!((r.determinant() - 1.0).abs() < 1e-6);
        assert!((r.transpose() * r - na::Matrix3::identity()).amax() < 1e-6);
        assert!(result.inlier_rmse < 1e-4);
    }

    #[test]
    fn zero_refinement_passes_are_rejected() {
        let target = random_cloud(50, 26);
        let err = refine(
            &target,
            &target,
            &RigidTransform::identity(),
            &config(EstimationMethod::PointToPoint),
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::InvalidInput {
                stage: Stage::FineAlignment,
                ..
            }
        ));
    }

    #[test]
    fn singular_point_to_plane_step_keeps_initial_guess() {
        let mut target = random_cloud(200, 27);
        target
            .set_normals(vec![na::Vector3::zeros(); target.len()])
            .unwrap();
        let source = target.transformed(&small_offset().inverse());
        let initial = RigidTransform::from_isometry(na::Isometry3::translation(0.001, 0.0, 0.0));
        let index = SpatialIndex::new(target.points(), 0.05);
        let result = align(
            &source,
            &target,
            &index,
            &initial,
            &config(EstimationMethod::PointToPlane),
        )
        .unwrap();
        assert_eq!(result.transform, initial);
        assert!(!result.converged);
        assert_eq!(result.iterations, 0);
        assert!(result.fitness > 0.0);
    }

    /// Symmetric 3x3x3 grid moved by +0.3 in x, one point at x = 5 moved by -0.2 and
    /// three points at x = -5, -7, -9 moved by +0.65. Everything lies on or is mirror
    /// symmetric about the x axis, so each Kabsch step is a pure x translation by the
    /// mean displacement of the current pairs.
    fn drifting_pair() -> (PointCloud, PointCloud) {
        let mut source = Vec::new();
        let mut target = Vec::new();
        for x in [-1.0, 0.0, 1.0] {
            for y in [-1.0, 0.0, 1.0] {
                for z in [-1.0, 0.0, 1.0] {
                    source.push(na::Point3::new(x, y, z));
                    target.push(na::Point3::new(x + 0.3, y, z));
                }
            }
        }
        source.push(na::Point3::new(5.0, 0.0, 0.0));
        target.push(na::Point3::new(4.8, 0.0, 0.0));
        for x in [-5.0, -7.0, -9.0] {
            source.push(na::Point3::new(x, 0.0, 0.0));
            target.push(na::Point3::new(x + 0.65, 0.0, 0.0));
        }
        (PointCloud::from_points(source), PointCloud::from_points(target))
    }

    #[test]
    fn refinement_keeps_last_or_best_pass() {
        let (source, target) = drifting_pair();
        let config = IcpConfig {
            max_correspondence_distance: 0.5,
            max_iterations: 1,
            relative_fitness: 1e-9,
            relative_rmse: 1e-9,
            method: EstimationMethod::PointToPoint,
        };
        // pass 1: grid and x = 5 pair, shift 7.9 / 28, all 31 points are inliers
        // pass 2: all pairs, shift 9.85 / 31, the x = 5 point drops out
        // pass 3: grid and x < 0 pairs, shift 10.05 / 30
        let last = refine(&source, &target, &RigidTransform::identity(), &config, 3, false).unwrap();
        assert!((last.fitness - 30.0 / 31.0).abs() < 1e-12);
        assert!((last.transform.translation() - na::Vector3::new(0.335, 0.0, 0.0)).norm() < 1e-9);

        let best = refine(&source, &target, &RigidTransform::identity(), &config, 3, true).unwrap();
        assert_eq!(best.fitness, 1.0);
        assert!(
            (best.transform.translation() - na::Vector3::new(7.9 / 28.0, 0.0, 0.0)).norm() < 1e-9
        );
    }
}
