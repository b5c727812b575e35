use nalgebra as na;
use rayon::prelude::*;

use crate::{
    config::NormalConfig,
    error::{RegistrationError, Result, Stage},
    normals::{self, NormalStats},
    transform::RigidTransform,
    voxel_util,
};

/// Ordered 3-D points with optional per-point normals and colors.
///
/// Normals and colors are either empty or exactly as long as the points.
/// A zero normal marks a point whose normal could not be estimated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<na::Point3<f64>>,
    normals: Vec<na::Vector3<f64>>,
    colors: Vec<[f32; 3]>,
}

impl PointCloud {
    pub fn new() -> PointCloud {
        PointCloud::default()
    }

    pub fn from_points(points: Vec<na::Point3<f64>>) -> PointCloud {
        PointCloud {
            points,
            normals: Vec::new(),
            colors: Vec::new(),
        }
    }

    pub fn from_coordinates(coordinates: &[[f64; 3]]) -> PointCloud {
        PointCloud::from_points(
            coordinates
                .iter()
                .map(|c| na::Point3::new(c[0], c[1], c[2]))
                .collect(),
        )
    }

    pub(crate) fn from_parts(
        points: Vec<na::Point3<f64>>,
        normals: Vec<na::Vector3<f64>>,
        colors: Vec<[f32; 3]>,
    ) -> PointCloud {
        debug_assert!(normals.is_empty() || normals.len() == points.len());
        debug_assert!(colors.is_empty() || colors.len() == points.len());
        PointCloud {
            points,
            normals,
            colors,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[na::Point3<f64>] {
        &self.points
    }

    pub fn normals(&self) -> Option<&[na::Vector3<f64>]> {
        (!self.normals.is_empty()).then_some(self.normals.as_slice())
    }

    pub fn colors(&self) -> Option<&[[f32; 3]]> {
        (!self.colors.is_empty()).then_some(self.colors.as_slice())
    }

    pub fn has_normals(&self) -> bool {
        !self.points.is_empty() && !self.normals.is_empty()
    }

    pub fn has_colors(&self) -> bool {
        !self.points.is_empty() && !self.colors.is_empty()
    }

    /// False when normals are missing or the normal at `i` is undefined.
    pub fn has_valid_normal(&self, i: usize) -> bool {
        self.normals
            .get(i)
            .is_some_and(|n| n.norm_squared() > 0.0)
    }

    pub fn set_normals(&mut self, normals: Vec<na::Vector3<f64>>) -> Result<()> {
        check_parallel_len(Stage::Normals, "normals", normals.len(), self.len())?;
        self.normals = normals;
        Ok(())
    }

    pub fn set_colors(&mut self, colors: Vec<[f32; 3]>) -> Result<()> {
        check_parallel_len(Stage::Load, "colors", colors.len(), self.len())?;
        self.colors = colors;
        Ok(())
    }

    pub fn paint_uniform_color(&mut self, rgb: [f32; 3]) {
        self.colors = vec![rgb; self.points.len()];
    }

    /// Applies `p' = R p + t` to points and `n' = R n` to normals.
    pub fn transform(&mut self, transform: &RigidTransform) {
        self.points.par_iter_mut().for_each(|pt| {
            *pt = transform.transform_point(pt);
        });
        self.normals.par_iter_mut().for_each(|n| {
            *n = transform
                .transform_vector(n)
                .try_normalize(1e-12)
                .unwrap_or_else(na::Vector3::zeros);
        });
    }

    pub fn transformed(&self, transform: &RigidTransform) -> PointCloud {
        let mut cloud = self.clone();
        cloud.transform(transform);
        cloud
    }

    /// Voxel-grid downsampling; see [`voxel_util::voxel_downsample`].
    pub fn downsample(&self, voxel_size: f64) -> Result<PointCloud> {
        if !(voxel_size > 0.0 && voxel_size.is_finite()) {
            return Err(RegistrationError::invalid_input(
                Stage::Downsample,
                format!("voxel_size must be positive, got {}", voxel_size),
            ));
        }
        Ok(voxel_util::voxel_downsample(self, voxel_size))
    }

    /// Replaces the normals with covariance-based estimates.
    pub fn estimate_normals(&mut self, config: &NormalConfig) -> Result<NormalStats> {
        config.validate()?;
        let (normals, stats) = normals::estimate_normals(&self.points, config)?;
        self.normals = normals;
        Ok(stats)
    }

    /// Concatenates clouds; normals and colors survive only if every input has them.
    pub fn merge(clouds: &[&PointCloud]) -> PointCloud {
        let non_empty: Vec<&PointCloud> = clouds.iter().copied().filter(|c| !c.is_empty()).collect();
        let keep_normals = !non_empty.is_empty() && non_empty.iter().all(|c| c.has_normals());
        let keep_colors = !non_empty.is_empty() && non_empty.iter().all(|c| c.has_colors());

        let mut merged = PointCloud::new();
        for cloud in non_empty {
            merged.points.extend_from_slice(&cloud.points);
            if keep_normals {
                merged.normals.extend_from_slice(&cloud.normals);
            }
            if keep_colors {
                merged.colors.extend_from_slice(&cloud.colors);
            }
        }
        merged
    }
}

fn check_parallel_len(stage: Stage, what: &str, len: usize, expected: usize) -> Result<()> {
    if len != 0 && len != expected {
        return Err(RegistrationError::invalid_input(
            stage,
            format!("{} has {} entries but the cloud has {} points", what, len, expected),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_cloud(n: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        PointCloud::from_points(
            (0..n)
                .map(|_| {
                    na::Point3::new(
                        rng.random_range(0.0..1.0),
                        rng.random_range(0.0..1.0),
                        rng.random_range(0.0..1.0),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn transform_round_trip() {
        let cloud = random_cloud(500, 1);
        let t = RigidTransform::from_isometry(na::Isometry3::new(
            na::Vector3::new(0.5, -2.0, 0.25),
            na::Vector3::new(0.3, 0.2, -0.9),
        ));
        let back = cloud.transformed(&t).transformed(&t.inverse());
        for (a, b) in cloud.points().iter().zip(back.points()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn transform_rotates_normals_only() {
        let mut cloud = PointCloud::from_points(vec![na::Point3::new(1.0, 0.0, 0.0)]);
        cloud.set_normals(vec![na::Vector3::x()]).unwrap();
        let t = RigidTransform::from_isometry(na::Isometry3::new(
            na::Vector3::new(5.0, 5.0, 5.0),
            na::Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2),
        ));
        cloud.transform(&t);
        assert!((cloud.points()[0] - na::Point3::new(5.0, 6.0, 5.0)).norm() < 1e-12);
        assert!((cloud.normals().unwrap()[0] - na::Vector3::y()).norm() < 1e-12);
    }

    #[test]
    fn downsample_rejects_non_positive_voxel() {
        let cloud = random_cloud(10, 2);
        for voxel in [0.0, -1.0, f64::NAN] {
            let err = cloud.downsample(voxel).unwrap_err();
            assert!(matches!(
                err,
                RegistrationError::InvalidInput {
                    stage: Stage::Downsample,
                    ..
                }
            ));
        }
    }

    #[test]
    fn downsample_never_grows_and_is_nearly_idempotent() {
        let cloud = random_cloud(5000, 3);
        let once = cloud.downsample(0.05).unwrap();
        let twice = once.downsample(0.05).unwrap();
        assert!(once.len() <= cloud.len());
        assert!(twice.len() <= once.len());
        // centroids stay inside their voxel, so a second pass is a fixed point
        assert_eq!(twice.len(), once.len());
    }

    #[test]
    fn downsample_is_deterministic() {
        let cloud = random_cloud(3000, 4);
        assert_eq!(cloud.downsample(0.1).unwrap(), cloud.downsample(0.1).unwrap());
    }

    #[test]
    fn merge_concatenates_and_drops_partial_attributes() {
        let mut a = random_cloud(3, 5);
        let mut b = random_cloud(4, 6);
        a.paint_uniform_color([1.0, 0.0, 0.0]);
        b.paint_uniform_color([0.0, 0.0, 1.0]);
        let merged = PointCloud::merge(&[&a, &b]);
        assert_eq!(merged.len(), 7);
        assert_eq!(merged.points()[3], b.points()[0]);
        assert_eq!(merged.colors().unwrap()[2], [1.0, 0.0, 0.0]);
        assert_eq!(merged.colors().unwrap()[3], [0.0, 0.0, 1.0]);

        let plain = random_cloud(2, 7);
        assert!(PointCloud::merge(&[&a, &plain]).colors().is_none());
    }

    #[test]
    fn mismatched_normals_are_rejected() {
        let mut cloud = random_cloud(3, 8);
        assert!(cloud.set_normals(vec![na::Vector3::x()]).is_err());
    }
}
