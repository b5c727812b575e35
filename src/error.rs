//! Error types for the registration pipeline.

use std::fmt;
use thiserror::Error;

/// Pipeline stage at which a failure was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Downsample,
    Normals,
    Features,
    CoarseAlignment,
    FineAlignment,
    Store,
    Visualize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Downsample => "downsample",
            Stage::Normals => "normal estimation",
            Stage::Features => "feature extraction",
            Stage::CoarseAlignment => "coarse alignment",
            Stage::FineAlignment => "fine alignment",
            Stage::Store => "store",
            Stage::Visualize => "visualize",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid input during {stage}: {message}")]
    InvalidInput { stage: Stage, message: String },

    #[error("insufficient geometry during {stage}: {message}")]
    InsufficientGeometry { stage: Stage, message: String },

    #[error("no convergence during {stage}: {message}")]
    NoConvergence { stage: Stage, message: String },

    #[error("degenerate transform: {0}")]
    DegenerateTransform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("point cloud file {path}: {message}")]
    PointCloudFile { path: String, message: String },

    #[error("visualization error: {0}")]
    Visualization(String),
}

impl RegistrationError {
    pub fn invalid_input(stage: Stage, message: impl Into<String>) -> Self {
        RegistrationError::InvalidInput {
            stage,
            message: message.into(),
        }
    }

    pub fn insufficient_geometry(stage: Stage, message: impl Into<String>) -> Self {
        RegistrationError::InsufficientGeometry {
            stage,
            message: message.into(),
        }
    }

    pub fn no_convergence(stage: Stage, message: impl Into<String>) -> Self {
        RegistrationError::NoConvergence {
            stage,
            message: message.into(),
        }
    }

    /// Stage the error was raised at, when it carries one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RegistrationError::InvalidInput { stage, .. }
            | RegistrationError::InsufficientGeometry { stage, .. }
            | RegistrationError::NoConvergence { stage, .. } => Some(*stage),
            RegistrationError::Visualization(_) => Some(Stage::Visualize),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
