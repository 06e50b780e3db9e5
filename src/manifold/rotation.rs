//! Camera orientation with a representation chosen at construction time.
//!
//! BAL files store camera rotations as angle-axis vectors. The quaternion
//! variant keeps a unit quaternion instead, which avoids the singularity of the
//! angle-axis chart at |ω| = π. Both variants share the same 3-DOF tangent
//! space and the same left update `R_new = Exp(δω) · R_old`, so the rest of the
//! solver never needs to know which one it is working with.

use super::{ManifoldError, ManifoldResult, SO3};
use nalgebra::{Matrix3, Vector3};
use std::fmt;

/// External storage format of a camera rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationParameterization {
    /// Rotation vector `[ωx, ωy, ωz]`
    #[default]
    AngleAxis,
    /// Unit quaternion `[w, x, y, z]`
    Quaternion,
}

impl RotationParameterization {
    /// Number of stored rotation values (3 or 4).
    pub const fn parameter_count(self) -> usize {
        match self {
            RotationParameterization::AngleAxis => 3,
            RotationParameterization::Quaternion => 4,
        }
    }

    /// Number of stored values of a full camera block (9 or 10).
    pub const fn camera_block_size(self) -> usize {
        self.parameter_count() + 6
    }
}

impl fmt::Display for RotationParameterization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationParameterization::AngleAxis => write!(f, "angle-axis"),
            RotationParameterization::Quaternion => write!(f, "quaternion"),
        }
    }
}

/// A camera rotation in one of the supported representations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Orientation {
    AngleAxis(Vector3<f64>),
    Quaternion(SO3),
}

impl Orientation {
    pub fn identity(parameterization: RotationParameterization) -> Self {
        match parameterization {
            RotationParameterization::AngleAxis => Orientation::AngleAxis(Vector3::zeros()),
            RotationParameterization::Quaternion => Orientation::Quaternion(SO3::identity()),
        }
    }

    /// Build from an angle-axis vector, converting it when the quaternion
    /// representation is requested.
    pub fn from_angle_axis(
        angle_axis: Vector3<f64>,
        parameterization: RotationParameterization,
    ) -> ManifoldResult<Self> {
        if !angle_axis.iter().all(|v| v.is_finite()) {
            return Err(ManifoldError::InvalidAngleAxis([
                angle_axis.x,
                angle_axis.y,
                angle_axis.z,
            ]));
        }
        Ok(match parameterization {
            RotationParameterization::AngleAxis => Orientation::AngleAxis(angle_axis),
            RotationParameterization::Quaternion => {
                Orientation::Quaternion(SO3::exp(&angle_axis))
            }
        })
    }

    /// Build from stored values: `[ωx, ωy, ωz]` or `[w, x, y, z]`.
    pub fn from_parameters(
        values: &[f64],
        parameterization: RotationParameterization,
    ) -> ManifoldResult<Self> {
        let expected = parameterization.parameter_count();
        if values.len() != expected {
            return Err(ManifoldError::InvalidParameterCount {
                expected,
                actual: values.len(),
            });
        }

        match parameterization {
            RotationParameterization::AngleAxis => Self::from_angle_axis(
                Vector3::new(values[0], values[1], values[2]),
                parameterization,
            ),
            RotationParameterization::Quaternion => Ok(Orientation::Quaternion(
                SO3::from_quaternion_coeffs(values[0], values[1], values[2], values[3])?,
            )),
        }
    }

    pub fn parameterization(&self) -> RotationParameterization {
        match self {
            Orientation::AngleAxis(_) => RotationParameterization::AngleAxis,
            Orientation::Quaternion(_) => RotationParameterization::Quaternion,
        }
    }

    /// Append the stored values to `out`.
    pub fn extend_parameters(&self, out: &mut Vec<f64>) {
        match self {
            Orientation::AngleAxis(omega) => out.extend_from_slice(omega.as_slice()),
            Orientation::Quaternion(rotation) => out.extend_from_slice(&rotation.coeffs()),
        }
    }

    pub fn to_parameters(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.parameterization().parameter_count());
        self.extend_parameters(&mut out);
        out
    }

    pub fn so3(&self) -> SO3 {
        match self {
            Orientation::AngleAxis(omega) => SO3::exp(omega),
            Orientation::Quaternion(rotation) => *rotation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.so3().rotation_matrix()
    }

    #[inline]
    pub fn rotate(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.so3().act(point)
    }

    pub fn to_angle_axis(&self) -> Vector3<f64> {
        match self {
            Orientation::AngleAxis(omega) => *omega,
            Orientation::Quaternion(rotation) => rotation.log(),
        }
    }

    /// Left update `Exp(δω) · R`, keeping the representation.
    ///
    /// A zero step returns the stored value bit for bit.
    pub fn compose(&self, delta: &Vector3<f64>) -> Self {
        if delta.iter().all(|d| *d == 0.0) {
            return *self;
        }
        match self {
            Orientation::AngleAxis(omega) => {
                Orientation::AngleAxis(SO3::exp(omega).left_plus(delta).log())
            }
            Orientation::Quaternion(rotation) => Orientation::Quaternion(rotation.left_plus(delta)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_block_sizes() {
        assert_eq!(RotationParameterization::AngleAxis.camera_block_size(), 9);
        assert_eq!(RotationParameterization::Quaternion.camera_block_size(), 10);
    }

    #[test]
    fn test_parameter_round_trip() -> ManifoldResult<()> {
        let angle_axis =
            Orientation::from_parameters(&[0.1, 0.2, -0.3], RotationParameterization::AngleAxis)?;
        assert_eq!(angle_axis.to_parameters(), vec![0.1, 0.2, -0.3]);

        let quaternion = Orientation::from_parameters(
            &[1.0, 0.0, 0.0, 0.0],
            RotationParameterization::Quaternion,
        )?;
        assert_eq!(quaternion.to_parameters(), vec![1.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_wrong_parameter_count() {
        let result = Orientation::from_parameters(&[0.1, 0.2], RotationParameterization::AngleAxis);
        assert_eq!(
            result,
            Err(ManifoldError::InvalidParameterCount {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_representations_agree() -> ManifoldResult<()> {
        let omega = Vector3::new(0.3, -0.8, 0.25);
        let a = Orientation::from_angle_axis(omega, RotationParameterization::AngleAxis)?;
        let q = Orientation::from_angle_axis(omega, RotationParameterization::Quaternion)?;
        let p = Vector3::new(1.5, -0.5, 4.0);

        assert!((a.rotate(&p) - q.rotate(&p)).norm() < TOLERANCE);
        assert!((q.to_angle_axis() - omega).norm() < TOLERANCE);

        let delta = Vector3::new(0.01, 0.02, -0.03);
        let a2 = a.compose(&delta);
        let q2 = q.compose(&delta);
        assert!((a2.rotation_matrix() - q2.rotation_matrix()).norm() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_zero_update_is_identity() -> ManifoldResult<()> {
        for parameterization in [
            RotationParameterization::AngleAxis,
            RotationParameterization::Quaternion,
        ] {
            let orientation =
                Orientation::from_angle_axis(Vector3::new(0.4, 0.1, -1.3), parameterization)?;
            assert_eq!(orientation.compose(&Vector3::zeros()), orientation);
        }
        Ok(())
    }

    #[test]
    fn test_update_is_left_multiplication() -> ManifoldResult<()> {
        let orientation = Orientation::from_angle_axis(
            Vector3::new(0.2, 0.0, 0.1),
            RotationParameterization::AngleAxis,
        )?;
        let delta = Vector3::new(0.0, 0.05, 0.0);
        let expected = SO3::exp(&delta).rotation_matrix() * orientation.rotation_matrix();
        assert!((orientation.compose(&delta).rotation_matrix() - expected).norm() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_non_finite_angle_axis_rejected() {
        let result = Orientation::from_angle_axis(
            Vector3::new(f64::NAN, 0.0, 0.0),
            RotationParameterization::AngleAxis,
        );
        assert!(matches!(result, Err(ManifoldError::InvalidAngleAxis(_))));
    }
}
