use nalgebra as na;

pub trait Hat {
    fn hat(&self) -> na::Matrix3<f64>;
}

impl Hat for na::Vector3<f64> {
    fn hat(&self) -> na::Matrix3<f64> {
        na::Matrix3::new(
            0.0, -self.z, self.y, //
            self.z, 0.0, -self.x, //
            -self.y, self.x, 0.0,
        )
    }
}

/// SE(3) exponential of a tangent vector laid out as [trans 3, rotation 3].
pub trait Exp {
    fn exp(&self) -> na::Isometry3<f64>;
}

impl Exp for na::Vector6<f64> {
    fn exp(&self) -> na::Isometry3<f64> {
        let rho = self.fixed_rows::<3>(0).into_owned();
        let omega = self.fixed_rows::<3>(3).into_owned();
        let theta = omega.norm();
        let omega_hat = omega.hat();

        let v = if theta < 1e-10 {
            na::Matrix3::identity() + 0.5 * omega_hat
        } else {
            let theta2 = theta * theta;
            na::Matrix3::identity()
                + ((1.0 - theta.cos()) / theta2) * omega_hat
                + ((theta - theta.sin()) / (theta2 * theta)) * omega_hat * omega_hat
        };

        na::Isometry3::from_parts(
            na::Translation3::from(v * rho),
            na::UnitQuaternion::from_scaled_axis(omega),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hat_is_cross_product() {
        let a = na::Vector3::new(0.3, -1.2, 2.0);
        let b = na::Vector3::new(-0.7, 0.4, 0.9);
        assert_relative_eq!(a.hat() * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn exp_of_pure_translation() {
        let dx = na::Vector6::new(1.0, 2.0, 3.0, 0.0, 0.0, 0.0);
        let iso = dx.exp();
        assert_relative_eq!(iso.translation.vector, na::Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(iso.rotation.angle(), 0.0);
    }

    #[test]
    fn exp_rotation_matches_axis_angle() {
        let dx = na::Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.5);
        let iso = dx.exp();
        assert_relative_eq!(iso.rotation.angle(), 0.5, epsilon = 1e-12);
    }
}
