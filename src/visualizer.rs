use log::debug;
use nalgebra as na;

use crate::{
    config::CameraConfig,
    error::{RegistrationError, Result},
    point_cloud::PointCloud,
};

/// Display sink for diagnostic views of the registration.
pub trait Visualizer {
    fn show(&self, clouds: &[&PointCloud], camera: &CameraConfig) -> Result<()>;
}

fn na_to_rerun(transform: &na::Isometry3<f64>) -> rerun::Transform3D {
    rerun::Transform3D::from_translation_rotation(
        [
            transform.translation.x as f32,
            transform.translation.y as f32,
            transform.translation.z as f32,
        ],
        rerun::Quaternion::from_wxyz([
            transform.rotation.w as f32,
            transform.rotation.i as f32,
            transform.rotation.j as f32,
            transform.rotation.k as f32,
        ]),
    )
}

fn rerun_error(e: impl std::fmt::Display) -> RegistrationError {
    RegistrationError::Visualization(e.to_string())
}

/// Colors of the cloud when present, otherwise one CATEGORY10 color per cloud.
pub fn get_colors_for_cloud(cloud: &PointCloud, cloud_idx: usize) -> Vec<(u8, u8, u8, u8)> {
    match cloud.colors() {
        Some(colors) => colors
            .iter()
            .map(|c| {
                let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                (byte(c[0]), byte(c[1]), byte(c[2]), 255)
            })
            .collect(),
        None => {
            let c = colorous::CATEGORY10[cloud_idx % colorous::CATEGORY10.len()];
            vec![(c.r, c.g, c.b, 255); cloud.len()]
        }
    }
}

/// Diagonal of the axis-aligned box around every point, or `None` when there are no points.
fn bounding_extent(clouds: &[&PointCloud]) -> Option<f64> {
    let mut points = clouds.iter().flat_map(|c| c.points().iter());
    let first = points.next()?;
    let (lo, hi) = points.fold((first.coords, first.coords), |(lo, hi), p| {
        (lo.inf(&p.coords), hi.sup(&p.coords))
    });
    Some((hi - lo).norm())
}

/// Look-at pose of the viewing camera; `front` points from `lookat` to the eye.
pub fn camera_pose(camera: &CameraConfig, extent: f64) -> Result<na::Isometry3<f64>> {
    let front = na::Vector3::from(camera.front)
        .try_normalize(1e-12)
        .ok_or_else(|| rerun_error("camera front must be non-zero"))?;
    let up = na::Vector3::from(camera.up);
    if up.cross(&front).norm_squared() < 1e-12 {
        return Err(rerun_error("camera up must not be parallel to front"));
    }
    if !(camera.zoom > 0.0) {
        return Err(rerun_error(format!("camera zoom must be positive, got {}", camera.zoom)));
    }
    let lookat = na::Point3::from(camera.lookat);
    let eye = lookat + front * (extent.max(f64::EPSILON) / camera.zoom);
    Ok(na::Isometry3::face_towards(&eye, &lookat, &up))
}

/// Streams clouds to a spawned rerun viewer; clones share the same viewer.
#[derive(Clone)]
pub struct RerunVisualizer {
    recording: rerun::RecordingStream,
    point_radius: f32,
}

impl RerunVisualizer {
    pub fn spawn(app_id: &str) -> Result<RerunVisualizer> {
        let recording = rerun::RecordingStreamBuilder::new(app_id)
            .spawn()
            .map_err(rerun_error)?;
        Ok(RerunVisualizer {
            recording,
            point_radius: 0.0005,
        })
    }

    pub fn with_point_radius(mut self, point_radius: f32) -> RerunVisualizer {
        self.point_radius = point_radius;
        self
    }
}

impl Visualizer for RerunVisualizer {
    fn show(&self, clouds: &[&PointCloud], camera: &CameraConfig) -> Result<()> {
        for (i, cloud) in clouds.iter().enumerate() {
            let colors = get_colors_for_cloud(cloud, i);
            self.recording
                .log(
                    format!("clouds/{}", i),
                    &rerun::Points3D::new(
                        cloud
                            .points()
                            .iter()
                            .map(|p| (p.x as f32, p.y as f32, p.z as f32)),
                    )
                    .with_radii([self.point_radius])
                    .with_colors(colors),
                )
                .map_err(rerun_error)?;
        }
        if let Some(extent) = bounding_extent(clouds) {
            let pose = camera_pose(camera, extent)?;
            self.recording
                .log(
                    "camera",
                    &na_to_rerun(&pose).with_axis_length((extent * 0.1) as f32),
                )
                .map_err(rerun_error)?;
        }
        debug!("sent {} clouds to the viewer", clouds.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_sits_in_front_of_lookat() {
        let camera = CameraConfig::default_values();
        let pose = camera_pose(&camera, 2.0).unwrap();
        let eye = pose.translation.vector;
        // default front is -z, zoom 0.8
        assert!((eye - na::Vector3::new(0.0, 0.0, -2.5)).norm() < 1e-12);
        // local z axis looks at the target
        let forward = pose.rotation * na::Vector3::z();
        assert!((forward - na::Vector3::z()).norm() < 1e-12);
    }

    #[test]
    fn degenerate_camera_is_rejected() {
        let mut camera = CameraConfig::default_values();
        camera.up = [0.0, 0.0, 1.0];
        assert!(matches!(
            camera_pose(&camera, 1.0),
            Err(RegistrationError::Visualization(_))
        ));
    }

    #[test]
    fn uncolored_clouds_get_palette_colors() {
        let a = PointCloud::from_coordinates(&[[0.0, 0.0, 0.0]]);
        let mut b = PointCloud::from_coordinates(&[[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
        b.paint_uniform_color([1.0, 0.0, 0.0]);
        let c = colorous::CATEGORY10[0];
        assert_eq!(get_colors_for_cloud(&a, 0), vec![(c.r, c.g, c.b, 255)]);
        assert_eq!(get_colors_for_cloud(&b, 1), vec![(255, 0, 0, 255); 2]);
    }

    #[test]
    fn extent_covers_all_clouds() {
        let a = PointCloud::from_coordinates(&[[0.0, 0.0, 0.0]]);
        let b = PointCloud::from_coordinates(&[[3.0, 4.0, 0.0]]);
        assert_eq!(bounding_extent(&[&a, &b]), Some(5.0));
        assert_eq!(bounding_extent(&[]), None);
    }

    #[test]
    fn point_radius_override_reaches_the_stream() {
        let visualizer = RerunVisualizer {
            recording: rerun::RecordingStream::disabled(),
            point_radius: 0.0005,
        }
        .with_point_radius(0.01);
        assert_eq!(visualizer.point_radius, 0.01);
        let cloud = PointCloud::from_coordinates(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        visualizer
            .show(&[&cloud], &CameraConfig::default_values())
            .unwrap();
    }
}
