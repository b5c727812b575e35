//! Rigid transforms, closed-form rigid-motion fitting and 6-DoF decomposition.

use nalgebra as na;
use std::ops::Mul;

use crate::error::{RegistrationError, Result};

/// Tolerance used to accept a rotation block as orthonormal.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// Proper rigid motion `p' = R p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    isometry: na::Isometry3<f64>,
}

impl RigidTransform {
    pub fn identity() -> RigidTransform {
        RigidTransform {
            isometry: na::Isometry3::identity(),
        }
    }

    pub fn from_isometry(isometry: na::Isometry3<f64>) -> RigidTransform {
        RigidTransform {
            isometry: renormalize(isometry),
        }
    }

    /// Rejects rotation blocks that are not orthonormal with determinant +1.
    pub fn from_parts(rotation: &na::Matrix3<f64>, translation: &na::Vector3<f64>) -> Result<RigidTransform> {
        if !is_orthonormal(rotation, ORTHONORMAL_TOLERANCE) {
            return Err(RegistrationError::DegenerateTransform(format!(
                "rotation block is not orthonormal (det {:.9})",
                rotation.determinant()
            )));
        }
        let rotation = na::Rotation3::from_matrix_unchecked(*rotation);
        Ok(RigidTransform {
            isometry: na::Isometry3::from_parts(
                na::Translation3::from(*translation),
                na::UnitQuaternion::from_rotation_matrix(&rotation),
            ),
        })
    }

    /// Parses a 4x4 homogeneous matrix, rejecting anything that is not a proper rigid motion.
    pub fn from_matrix(matrix: &na::Matrix4<f64>) -> Result<RigidTransform> {
        let bottom = matrix.fixed_view::<1, 4>(3, 0);
        if (bottom - na::RowVector4::new(0.0, 0.0, 0.0, 1.0)).norm() > ORTHONORMAL_TOLERANCE {
            return Err(RegistrationError::DegenerateTransform(format!(
                "bottom row must be [0 0 0 1], got {}",
                bottom
            )));
        }
        let rotation: na::Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let translation: na::Vector3<f64> = matrix.fixed_view::<3, 1>(0, 3).into_owned();
        RigidTransform::from_parts(&rotation, &translation)
    }

    pub fn to_matrix(&self) -> na::Matrix4<f64> {
        self.isometry.to_homogeneous()
    }

    pub fn isometry(&self) -> &na::Isometry3<f64> {
        &self.isometry
    }

    pub fn rotation_matrix(&self) -> na::Matrix3<f64> {
        self.isometry.rotation.to_rotation_matrix().into_inner()
    }

    pub fn translation(&self) -> na::Vector3<f64> {
        self.isometry.translation.vector
    }

    pub fn inverse(&self) -> RigidTransform {
        RigidTransform {
            isometry: self.isometry.inverse(),
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &na::Point3<f64>) -> na::Point3<f64> {
        self.isometry.transform_point(point)
    }

    #[inline]
    pub fn transform_vector(&self, vector: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.isometry.transform_vector(vector)
    }

    pub fn pose(&self) -> Pose6Dof {
        let (roll, pitch, yaw) = self.isometry.rotation.euler_angles();
        Pose6Dof {
            translation: self.translation(),
            euler_angles: na::Vector3::new(roll, pitch, yaw),
        }
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        RigidTransform::identity()
    }
}

impl Mul for RigidTransform {
    type Output = RigidTransform;

    fn mul(self, rhs: RigidTransform) -> RigidTransform {
        RigidTransform::from_isometry(self.isometry * rhs.isometry)
    }
}

// repeated products let the quaternion drift off the unit sphere
fn renormalize(isometry: na::Isometry3<f64>) -> na::Isometry3<f64> {
    na::Isometry3::from_parts(
        isometry.translation,
        na::UnitQuaternion::from_quaternion(isometry.rotation.into_inner()),
    )
}

/// Translation plus roll/pitch/yaw in radians, `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose6Dof {
    pub translation: na::Vector3<f64>,
    pub euler_angles: na::Vector3<f64>,
}

impl Pose6Dof {
    pub fn euler_angles_degrees(&self) -> na::Vector3<f64> {
        self.euler_angles.map(f64::to_degrees)
    }

    pub fn to_transform(&self) -> RigidTransform {
        RigidTransform::from_isometry(na::Isometry3::from_parts(
            na::Translation3::from(self.translation),
            na::UnitQuaternion::from_euler_angles(
                self.euler_angles.x,
                self.euler_angles.y,
                self.euler_angles.z,
            ),
        ))
    }
}

pub fn is_orthonormal(rotation: &na::Matrix3<f64>, tolerance: f64) -> bool {
    let gram = rotation.transpose() * rotation;
    (gram - na::Matrix3::identity()).amax() <= tolerance
        && (rotation.determinant() - 1.0).abs() <= tolerance
}

/// Least-squares rigid motion mapping `source[i]` onto `target[i]` (Kabsch with reflection fix).
pub fn estimate_rigid_transform(
    source: &[na::Point3<f64>],
    target: &[na::Point3<f64>],
) -> Result<RigidTransform> {
    if source.len() != target.len() || source.len() < 3 {
        return Err(RegistrationError::DegenerateTransform(format!(
            "need at least 3 paired points, got {} and {}",
            source.len(),
            target.len()
        )));
    }

    let n = source.len() as f64;
    let source_centroid = source
        .iter()
        .fold(na::Vector3::zeros(), |acc, p| acc + p.coords)
        / n;
    let target_centroid = target
        .iter()
        .fold(na::Vector3::zeros(), |acc, p| acc + p.coords)
        / n;

    let covariance = source
        .iter()
        .zip(target.iter())
        .fold(na::Matrix3::<f64>::zeros(), |acc, (s, t)| {
            acc + (t.coords - target_centroid) * (s.coords - source_centroid).transpose()
        });

    let svd = covariance.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(RegistrationError::DegenerateTransform(
            "SVD of the cross-covariance did not converge".to_string(),
        ));
    };

    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let weakest = svd.singular_values.imin();
        let flipped = -u.column(weakest);
        u.set_column(weakest, &flipped);
        rotation = u * v_t;
    }

    let translation = target_centroid - rotation * source_centroid;
    RigidTransform::from_parts(&rotation, &translation)
}
