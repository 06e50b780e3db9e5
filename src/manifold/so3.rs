//! SO3 - Special Orthogonal Group in 3D
//!
//! SO(3) elements are stored as nalgebra `UnitQuaternion<f64>`. Tangent
//! elements are rotation vectors in R³: the direction is the rotation axis and
//! the magnitude is the angle in radians.

use super::{ManifoldError, ManifoldResult, SMALL_ANGLE_THRESHOLD};
use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use std::fmt::{self, Display, Formatter};

/// SO(3) group element representing rotations in 3D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl Display for SO3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let q = self.quaternion.quaternion();
        write!(
            f,
            "SO3(quaternion: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            q.w, q.i, q.j, q.k
        )
    }
}

impl Default for SO3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl SO3 {
    /// Identity rotation.
    pub fn identity() -> Self {
        Self {
            quaternion: UnitQuaternion::identity(),
        }
    }

    /// Wrap an already normalized quaternion.
    pub fn new(quaternion: UnitQuaternion<f64>) -> Self {
        Self { quaternion }
    }

    /// Build from raw `[w, x, y, z]` coefficients, normalizing them.
    ///
    /// Fails when the coefficients are non-finite or have (near) zero norm.
    pub fn from_quaternion_coeffs(w: f64, x: f64, y: f64, z: f64) -> ManifoldResult<Self> {
        let q = Quaternion::new(w, x, y, z);
        let norm = q.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return Err(ManifoldError::InvalidQuaternion { w, x, y, z });
        }
        Ok(Self {
            quaternion: UnitQuaternion::new_normalize(q),
        })
    }

    /// Exponential map from a rotation vector.
    ///
    /// For tiny angles the first-order quaternion `[1, ω/2]` is normalized
    /// instead of going through `sin(θ/2)/θ`.
    pub fn exp(omega: &Vector3<f64>) -> Self {
        let theta_squared = omega.norm_squared();

        let quaternion = if theta_squared > SMALL_ANGLE_THRESHOLD {
            UnitQuaternion::from_scaled_axis(*omega)
        } else {
            UnitQuaternion::from_quaternion(Quaternion::new(
                1.0,
                omega.x / 2.0,
                omega.y / 2.0,
                omega.z / 2.0,
            ))
        };

        Self { quaternion }
    }

    /// Logarithmic map to a rotation vector with angle in [-π, π].
    pub fn log(&self) -> Vector3<f64> {
        let q = self.quaternion.quaternion();
        let sin_angle_squared = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_angle_squared > SMALL_ANGLE_THRESHOLD {
            let sin_angle = sin_angle_squared.sqrt();
            let cos_angle = q.w;

            // q and -q encode the same rotation; pick the branch with the
            // shorter angle.
            let two_angle = 2.0
                * if cos_angle < 0.0 {
                    f64::atan2(-sin_angle, -cos_angle)
                } else {
                    f64::atan2(sin_angle, cos_angle)
                };

            two_angle / sin_angle
        } else {
            2.0_f64.copysign(q.w)
        };

        Vector3::new(q.i * log_coeff, q.j * log_coeff, q.k * log_coeff)
    }

    /// Group composition `self ∘ other`.
    pub fn compose(&self, other: &SO3) -> SO3 {
        Self {
            quaternion: self.quaternion * other.quaternion,
        }
    }

    /// Left perturbation `Exp(δ) ∘ self`.
    pub fn left_plus(&self, delta: &Vector3<f64>) -> SO3 {
        SO3::exp(delta).compose(self)
    }

    pub fn inverse(&self) -> SO3 {
        Self {
            quaternion: self.quaternion.inverse(),
        }
    }

    /// Rotate a point.
    #[inline]
    pub fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * point
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    /// Quaternion coefficients in `[w, x, y, z]` order.
    pub fn coeffs(&self) -> [f64; 4] {
        let q = self.quaternion.quaternion();
        [q.w, q.i, q.j, q.k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_so3_identity() {
        let identity = SO3::identity();
        assert_eq!(identity.coeffs(), [1.0, 0.0, 0.0, 0.0]);
        assert!(identity.log().norm() < TOLERANCE);
    }

    #[test]
    fn test_so3_exp_log() {
        let omegas = [
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(1.0, 0.5, -2.0),
            Vector3::new(0.0, 0.0, PI - 1e-3),
            Vector3::new(1e-7, 2e-7, -1e-7),
        ];
        for omega in omegas {
            let recovered = SO3::exp(&omega).log();
            assert!(
                (recovered - omega).norm() < 1e-10,
                "exp/log round trip failed for {omega:?}: {recovered:?}"
            );
        }
    }

    #[test]
    fn test_so3_exp_zero_is_identity() {
        let r = SO3::exp(&Vector3::zeros());
        assert_eq!(r.coeffs(), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_so3_act_matches_matrix() {
        let r = SO3::exp(&Vector3::new(0.4, -0.1, 0.9));
        let p = Vector3::new(1.0, 2.0, -3.0);
        assert!((r.act(&p) - r.rotation_matrix() * p).norm() < TOLERANCE);
    }

    #[test]
    fn test_so3_compose_inverse() {
        let r = SO3::exp(&Vector3::new(0.7, 0.2, -0.5));
        let product = r.compose(&r.inverse());
        assert!(product.log().norm() < TOLERANCE);
    }

    #[test]
    fn test_so3_left_plus() {
        let r = SO3::exp(&Vector3::new(0.0, 0.0, 0.3));
        let updated = r.left_plus(&Vector3::new(0.0, 0.0, 0.2));
        assert!((updated.log() - Vector3::new(0.0, 0.0, 0.5)).norm() < TOLERANCE);
    }

    #[test]
    fn test_so3_from_coeffs_normalizes() -> ManifoldResult<()> {
        let r = SO3::from_quaternion_coeffs(2.0, 0.0, 0.0, 0.0)?;
        assert_eq!(r.coeffs(), [1.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_so3_from_zero_coeffs_fails() {
        let result = SO3::from_quaternion_coeffs(0.0, 0.0, 0.0, 0.0);
        assert!(matches!(result, Err(ManifoldError::InvalidQuaternion { .. })));
    }

    #[test]
    fn test_so3_log_shortest_branch() -> ManifoldResult<()> {
        // -q encodes the same rotation as q
        let q = SO3::exp(&Vector3::new(0.3, 0.0, 0.0)).coeffs();
        let negated = SO3::from_quaternion_coeffs(-q[0], -q[1], -q[2], -q[3])?;
        assert!((negated.log() - Vector3::new(0.3, 0.0, 0.0)).norm() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_so3_log_negated_small_angle() -> ManifoldResult<()> {
        let omega = Vector3::new(1e-7, -2e-7, 5e-8);
        let q = SO3::exp(&omega).coeffs();
        let negated = SO3::from_quaternion_coeffs(-q[0], -q[1], -q[2], -q[3])?;
        assert!((negated.log() - omega).norm() < 1e-15);
        Ok(())
    }
}
