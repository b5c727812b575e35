//! End-to-end registration of a source scan onto a target model.

use log::{debug, info};
use nalgebra as na;
use rand::{rngs::StdRng, SeedableRng};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use crate::{
    config::RegistrationConfig,
    error::{RegistrationError, Result, Stage},
    features::{compute_fpfh, FeatureSet},
    icp::{self, IcpResult},
    io::{self, Store},
    point_cloud::PointCloud,
    ransac::{self, CoarseResult},
    transform::{Pose6Dof, RigidTransform},
    visualizer::Visualizer,
};

pub const SOURCE_COLOR: [f32; 3] = [1.0, 0.0, 0.0];
pub const TARGET_COLOR: [f32; 3] = [0.0, 0.0, 1.0];

/// Where a cloud comes from.
#[derive(Debug, Clone)]
pub enum PointSource {
    Path(PathBuf),
    Points(Vec<[f64; 3]>),
}

impl From<&Path> for PointSource {
    fn from(path: &Path) -> Self {
        PointSource::Path(path.to_path_buf())
    }
}

impl From<PointCloud> for PointSource {
    fn from(cloud: PointCloud) -> Self {
        PointSource::Points(cloud.points().iter().map(|p| [p.x, p.y, p.z]).collect())
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    /// Downsampled source moved into the target frame.
    pub transformed_source: PointCloud,
    /// Downsampled target.
    pub target: PointCloud,
    /// Maps source coordinates into the target frame.
    pub transform: RigidTransform,
    pub pose: Pose6Dof,
    pub coarse: CoarseResult,
    pub fine: IcpResult,
}

pub struct RegistrationPipeline {
    config: RegistrationConfig,
    visualizer: Option<Box<dyn Visualizer>>,
    store: Option<(Box<dyn Store>, PathBuf)>,
}

struct Prepared {
    cloud: PointCloud,
    features: FeatureSet,
}

impl RegistrationPipeline {
    pub fn new(config: RegistrationConfig) -> RegistrationPipeline {
        RegistrationPipeline {
            config,
            visualizer: None,
            store: None,
        }
    }

    pub fn default_values() -> RegistrationPipeline {
        RegistrationPipeline::new(RegistrationConfig::default_values())
    }

    pub fn with_visualizer(mut self, visualizer: Box<dyn Visualizer>) -> RegistrationPipeline {
        self.visualizer = Some(visualizer);
        self
    }

    pub fn with_store(mut self, store: Box<dyn Store>, path: impl Into<PathBuf>) -> RegistrationPipeline {
        self.store = Some((store, path.into()));
        self
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn register(&self, source: PointSource, target: PointSource) -> Result<Registration> {
        self.config.validate()?;
        let start = Instant::now();

        let mut source = load(source, "source")?;
        let mut target = load(target, "target")?;
        source.paint_uniform_color(SOURCE_COLOR);
        target.paint_uniform_color(TARGET_COLOR);

        let source = self.prepare(source, "source")?;
        let target = self.prepare(target, "target")?;

        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(self.config.ransac.seed);
        let coarse = ransac::align(
            &source.cloud,
            &target.cloud,
            &source.features,
            &target.features,
            &self.config.ransac,
            &mut rng,
        )?;
        debug!(
            "coarse alignment: fitness {:.4}, rmse {:.6}, {} trials in {:?}",
            coarse.fitness,
            coarse.inlier_rmse,
            coarse.trials,
            now.elapsed()
        );

        let now = Instant::now();
        let fine = icp::refine(
            &source.cloud,
            &target.cloud,
            &coarse.transform,
            &self.config.icp,
            self.config.refinement_passes,
            self.config.keep_best_pass,
        )?;
        debug!(
            "fine alignment: fitness {:.4}, rmse {:.6} in {:?}",
            fine.fitness,
            fine.inlier_rmse,
            now.elapsed()
        );

        let transform = fine.transform;
        let pose = transform.pose();
        let degrees: na::Vector3<f64> = pose.euler_angles_degrees();
        info!(
            "pose: translation [{:.6}, {:.6}, {:.6}], roll/pitch/yaw [{:.3}, {:.3}, {:.3}] deg ({:?})",
            pose.translation.x,
            pose.translation.y,
            pose.translation.z,
            degrees.x,
            degrees.y,
            degrees.z,
            start.elapsed()
        );

        let transformed_source = source.cloud.transformed(&transform);
        let clouds = [&transformed_source, &target.cloud];
        if let Some(visualizer) = &self.visualizer {
            visualizer.show(&clouds, &self.config.camera)?;
        }
        if let Some((store, path)) = &self.store {
            store.save(&clouds, path)?;
            debug!("stored registered clouds to {}", path.display());
        }

        Ok(Registration {
            transformed_source,
            target: target.cloud,
            transform,
            pose,
            coarse,
            fine,
        })
    }

    fn prepare(&self, cloud: PointCloud, name: &str) -> Result<Prepared> {
        let now = Instant::now();
        let raw_len = cloud.len();
        let mut cloud = cloud.downsample(self.config.voxel_size)?;
        debug!(
            "{}: downsampled {} -> {} points in {:?}",
            name,
            raw_len,
            cloud.len(),
            now.elapsed()
        );

        let now = Instant::now();
        let stats = cloud.estimate_normals(&self.config.normals)?;
        debug!(
            "{}: {} normals ({} undefined) in {:?}",
            name,
            stats.estimated,
            stats.undefined,
            now.elapsed()
        );

        let now = Instant::now();
        let features = compute_fpfh(&cloud, &self.config.features)?;
        debug!(
            "{}: {} descriptors in {:?}",
            name,
            features.valid_count(),
            now.elapsed()
        );
        Ok(Prepared { cloud, features })
    }
}

fn load(source: PointSource, name: &str) -> Result<PointCloud> {
    let cloud = match source {
        PointSource::Path(path) => io::load_point_cloud(&path)?,
        PointSource::Points(coordinates) => PointCloud::from_coordinates(&coordinates),
    };
    if cloud.is_empty() {
        return Err(RegistrationError::invalid_input(
            Stage::Load,
            format!("{} cloud has no points", name),
        ));
    }
    if let Some(bad) = cloud
        .points()
        .iter()
        .position(|p| !p.coords.iter().all(|c| c.is_finite()))
    {
        return Err(RegistrationError::invalid_input(
            Stage::Load,
            format!("{} point {} is not finite", name, bad),
        ));
    }
    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_target_is_rejected_at_load() {
        let pipeline = RegistrationPipeline::default_values();
        let err = pipeline
            .register(
                PointSource::Points(vec![[0.0, 0.0, 0.0]]),
                PointSource::Points(Vec::new()),
            )
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Load));
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn non_finite_points_are_rejected() {
        let err = load(PointSource::Points(vec![[0.0, f64::NAN, 0.0]]), "source").unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::InvalidInput {
                stage: Stage::Load,
                ..
            }
        ));
    }

    #[test]
    fn invalid_config_fails_before_loading() {
        let mut config = RegistrationConfig::default_values();
        config.voxel_size = -1.0;
        let err = RegistrationPipeline::new(config)
            .register(
                PointSource::Path(PathBuf::from("missing.pcd")),
                PointSource::Path(PathBuf::from("missing.pcd")),
            )
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Downsample));
    }
}
