use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result, Stage};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NormalConfig {
    pub radius: f64,
    pub max_neighbors: usize,
}
impl NormalConfig {
    pub fn default_values() -> NormalConfig {
        NormalConfig {
            radius: 0.1,
            max_neighbors: 30,
        }
    }
    pub fn validate(&self) -> Result<()> {
        check_radius(Stage::Normals, self.radius, self.max_neighbors)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FeatureConfig {
    pub radius: f64,
    pub max_neighbors: usize,
}
impl FeatureConfig {
    pub fn default_values() -> FeatureConfig {
        FeatureConfig {
            radius: 0.2,
            max_neighbors: 30,
        }
    }
    pub fn validate(&self) -> Result<()> {
        check_radius(Stage::Features, self.radius, self.max_neighbors)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RansacConfig {
    pub max_correspondence_distance: f64,
    pub sample_size: usize,
    pub mutual_filter: bool,
    pub edge_length_similarity: f64,

    // convergence
    pub max_iterations: usize,
    pub confidence: f64,
    pub min_fitness: f64,
    pub seed: u64,
}
impl RansacConfig {
    pub fn default_values() -> RansacConfig {
        RansacConfig {
            max_correspondence_distance: 0.005,
            sample_size: 4,
            mutual_filter: true,
            edge_length_similarity: 0.9,

            max_iterations: 1_000_000,
            confidence: 0.999,
            min_fitness: 0.05,
            seed: 42,
        }
    }
    pub fn validate(&self) -> Result<()> {
        let stage = Stage::CoarseAlignment;
        if !(self.max_correspondence_distance > 0.0) {
            return Err(RegistrationError::invalid_input(
                stage,
                format!(
                    "max_correspondence_distance must be positive, got {}",
                    self.max_correspondence_distance
                ),
            ));
        }
        if self.sample_size < 3 {
            return Err(RegistrationError::invalid_input(
                stage,
                format!("sample_size must be at least 3, got {}", self.sample_size),
            ));
        }
        if !(0.0..=1.0).contains(&self.edge_length_similarity) {
            return Err(RegistrationError::invalid_input(
                stage,
                format!(
                    "edge_length_similarity must be in [0, 1], got {}",
                    self.edge_length_similarity
                ),
            ));
        }
        if self.max_iterations == 0 {
            return Err(RegistrationError::invalid_input(
                stage,
                "max_iterations must be positive",
            ));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(RegistrationError::invalid_input(
                stage,
                format!("confidence must be in (0, 1), got {}", self.confidence),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimationMethod {
    PointToPoint,
    PointToPlane,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IcpConfig {
    pub max_correspondence_distance: f64,
    pub max_iterations: usize,
    pub relative_fitness: f64,
    pub relative_rmse: f64,
    pub method: EstimationMethod,
}
impl IcpConfig {
    pub fn default_values() -> IcpConfig {
        IcpConfig {
            max_correspondence_distance: 0.005,
            max_iterations: 1000,
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            method: EstimationMethod::PointToPoint,
        }
    }
    pub fn validate(&self) -> Result<()> {
        if !(self.max_correspondence_distance > 0.0) {
            return Err(RegistrationError::invalid_input(
                Stage::FineAlignment,
                format!(
                    "max_correspondence_distance must be positive, got {}",
                    self.max_correspondence_distance
                ),
            ));
        }
        if self.max_iterations == 0 {
            return Err(RegistrationError::invalid_input(
                Stage::FineAlignment,
                "max_iterations must be positive",
            ));
        }
        Ok(())
    }
}

/// Look-at camera used by visualizers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CameraConfig {
    pub front: [f64; 3],
    pub lookat: [f64; 3],
    pub up: [f64; 3],
    pub zoom: f64,
}
impl CameraConfig {
    pub fn default_values() -> CameraConfig {
        CameraConfig {
            front: [0.0, 0.0, -1.0],
            lookat: [0.0, 0.0, 0.0],
            up: [0.0, -1.0, 0.0],
            zoom: 0.8,
        }
    }
}
impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig::default_values()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegistrationConfig {
    // preprocessing
    pub voxel_size: f64,
    pub normals: NormalConfig,
    pub features: FeatureConfig,

    // alignment
    pub ransac: RansacConfig,
    pub icp: IcpConfig,
    pub refinement_passes: usize,
    pub keep_best_pass: bool,

    // diagnostics
    pub camera: CameraConfig,
}
impl RegistrationConfig {
    pub fn default_values() -> RegistrationConfig {
        RegistrationConfig {
            voxel_size: 0.001,
            normals: NormalConfig::default_values(),
            features: FeatureConfig::default_values(),

            ransac: RansacConfig::default_values(),
            icp: IcpConfig::default_values(),
            refinement_passes: 20,
            keep_best_pass: false,

            camera: CameraConfig::default_values(),
        }
    }
    pub fn validate(&self) -> Result<()> {
        if !(self.voxel_size > 0.0 && self.voxel_size.is_finite()) {
            return Err(RegistrationError::invalid_input(
                Stage::Downsample,
                format!("voxel_size must be positive, got {}", self.voxel_size),
            ));
        }
        self.normals.validate()?;
        self.features.validate()?;
        self.ransac.validate()?;
        self.icp.validate()?;
        if self.refinement_passes == 0 {
            return Err(RegistrationError::invalid_input(
                Stage::FineAlignment,
                "refinement_passes must be positive",
            ));
        }
        Ok(())
    }
}
impl Default for RegistrationConfig {
    fn default() -> Self {
        RegistrationConfig::default_values()
    }
}

fn check_radius(stage: Stage, radius: f64, max_neighbors: usize) -> Result<()> {
    if !(radius > 0.0 && radius.is_finite()) {
        return Err(RegistrationError::invalid_input(
            stage,
            format!("radius must be positive, got {}", radius),
        ));
    }
    if max_neighbors == 0 {
        return Err(RegistrationError::invalid_input(
            stage,
            "max_neighbors must be positive",
        ));
    }
    Ok(())
}
