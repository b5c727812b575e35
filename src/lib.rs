pub mod config;
pub mod correspondence;
pub mod error;
pub mod features;
pub mod icp;
pub mod io;
pub mod lie_group;
pub mod normals;
pub mod pipeline;
pub mod point3d;
pub mod point_cloud;
pub mod ransac;
pub mod spatial_index;
pub mod transform;
pub mod visualizer;
pub mod voxel_util;

pub use error::{RegistrationError, Result, Stage};
pub use pipeline::{PointSource, Registration, RegistrationPipeline};
