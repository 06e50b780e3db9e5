//! Camera and point parameter blocks.
//!
//! A camera block holds Snavely's Bundler camera: rotation, translation, one
//! focal length and two radial distortion coefficients. Its tangent vector is
//! always 9-dimensional,
//!
//! ```text
//! δ = [δω (3), δt (3), δf, δk1, δk2]
//! ```
//!
//! whatever the rotation representation. Points are plain 3-vectors.

use crate::manifold::{ManifoldError, ManifoldResult, Orientation, RotationParameterization};
use nalgebra::{SVector, Vector3};

/// Tangent dimension of a camera block.
pub const CAMERA_DOF: usize = 9;

/// Tangent dimension of a point block.
pub const POINT_DOF: usize = 3;

pub type CameraTangent = SVector<f64, CAMERA_DOF>;

/// Camera state: `p_c = R·p + t`, then BAL projection with `f`, `k1`, `k2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraBlock {
    pub orientation: Orientation,
    pub translation: Vector3<f64>,
    pub focal_length: f64,
    pub k1: f64,
    pub k2: f64,
}

impl CameraBlock {
    pub fn new(
        orientation: Orientation,
        translation: Vector3<f64>,
        focal_length: f64,
        k1: f64,
        k2: f64,
    ) -> Self {
        Self {
            orientation,
            translation,
            focal_length,
            k1,
            k2,
        }
    }

    /// Build from stored values `[rotation, t, f, k1, k2]`, 9 or 10 of them.
    pub fn from_parameters(
        values: &[f64],
        parameterization: RotationParameterization,
    ) -> ManifoldResult<Self> {
        let expected = parameterization.camera_block_size();
        if values.len() != expected {
            return Err(ManifoldError::InvalidParameterCount {
                expected,
                actual: values.len(),
            });
        }
        let split = parameterization.parameter_count();
        let orientation = Orientation::from_parameters(&values[..split], parameterization)?;
        let rest = &values[split..];
        Ok(Self::new(
            orientation,
            Vector3::new(rest[0], rest[1], rest[2]),
            rest[3],
            rest[4],
            rest[5],
        ))
    }

    /// Build from an angle-axis rotation and the camera center `c`, with
    /// `t = -R·c`.
    pub fn from_angle_axis_and_center(
        angle_axis: Vector3<f64>,
        center: Vector3<f64>,
        focal_length: f64,
        k1: f64,
        k2: f64,
        parameterization: RotationParameterization,
    ) -> ManifoldResult<Self> {
        let orientation = Orientation::from_angle_axis(angle_axis, parameterization)?;
        let translation = -orientation.rotate(&center);
        Ok(Self::new(orientation, translation, focal_length, k1, k2))
    }

    pub fn parameterization(&self) -> RotationParameterization {
        self.orientation.parameterization()
    }

    pub fn extend_parameters(&self, out: &mut Vec<f64>) {
        self.orientation.extend_parameters(out);
        out.extend_from_slice(self.translation.as_slice());
        out.extend_from_slice(&[self.focal_length, self.k1, self.k2]);
    }

    pub fn to_parameters(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.parameterization().camera_block_size());
        self.extend_parameters(&mut out);
        out
    }

    /// Same camera stored with another rotation representation.
    pub fn with_parameterization(&self, parameterization: RotationParameterization) -> Self {
        if parameterization == self.parameterization() {
            return *self;
        }
        let orientation = match parameterization {
            RotationParameterization::AngleAxis => {
                Orientation::AngleAxis(self.orientation.to_angle_axis())
            }
            RotationParameterization::Quaternion => Orientation::Quaternion(self.orientation.so3()),
        };
        Self { orientation, ..*self }
    }

    /// Point in the camera frame, `R·p + t`.
    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.orientation.rotate(point) + self.translation
    }

    /// Camera center in world coordinates, `c = -Rᵀ·t`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.orientation.rotation_matrix().transpose() * self.translation)
    }

    /// Manifold update: rotation on the left, everything else additive.
    pub fn plus(&self, delta: &CameraTangent) -> Self {
        let rotation_step = Vector3::new(delta[0], delta[1], delta[2]);
        Self {
            orientation: self.orientation.compose(&rotation_step),
            translation: self.translation + Vector3::new(delta[3], delta[4], delta[5]),
            focal_length: self.focal_length + delta[6],
            k1: self.k1 + delta[7],
            k2: self.k2 + delta[8],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.orientation
            .to_parameters()
            .iter()
            .chain(self.translation.iter())
            .chain([self.focal_length, self.k1, self.k2].iter())
            .all(|v| v.is_finite())
    }
}

/// A 3D landmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointBlock {
    pub position: Vector3<f64>,
}

impl PointBlock {
    pub fn new(position: Vector3<f64>) -> Self {
        Self { position }
    }

    pub fn from_parameters(values: &[f64]) -> ManifoldResult<Self> {
        if values.len() != POINT_DOF {
            return Err(ManifoldError::InvalidParameterCount {
                expected: POINT_DOF,
                actual: values.len(),
            });
        }
        Ok(Self::new(Vector3::new(values[0], values[1], values[2])))
    }

    pub fn plus(&self, delta: &Vector3<f64>) -> Self {
        Self::new(self.position + delta)
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    fn sample_camera(parameterization: RotationParameterization) -> ManifoldResult<CameraBlock> {
        CameraBlock::from_angle_axis_and_center(
            Vector3::new(0.1, -0.2, 0.05),
            Vector3::new(1.0, 2.0, 10.0),
            500.0,
            -1e-7,
            2e-13,
            parameterization,
        )
    }

    #[test]
    fn test_center_round_trip() -> ManifoldResult<()> {
        let camera = sample_camera(RotationParameterization::AngleAxis)?;
        assert!((camera.center() - Vector3::new(1.0, 2.0, 10.0)).norm() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_parameter_layout() -> ManifoldResult<()> {
        let values = [0.1, 0.2, 0.3, 1.0, 2.0, 3.0, 400.0, 0.01, 0.001];
        let camera = CameraBlock::from_parameters(&values, RotationParameterization::AngleAxis)?;
        assert_eq!(camera.focal_length, 400.0);
        assert_eq!(camera.k2, 0.001);
        assert_eq!(camera.to_parameters(), values.to_vec());

        let quaternion = camera.with_parameterization(RotationParameterization::Quaternion);
        assert_eq!(quaternion.to_parameters().len(), 10);
        let back = CameraBlock::from_parameters(
            &quaternion.to_parameters(),
            RotationParameterization::Quaternion,
        )?;
        let p = Vector3::new(0.5, -1.0, 3.0);
        assert!((back.transform_point(&p) - camera.transform_point(&p)).norm() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_wrong_block_size() {
        let result = CameraBlock::from_parameters(&[0.0; 9], RotationParameterization::Quaternion);
        assert!(matches!(
            result,
            Err(ManifoldError::InvalidParameterCount {
                expected: 10,
                actual: 9
            })
        ));
    }

    #[test]
    fn test_zero_update_leaves_blocks_unchanged() -> ManifoldResult<()> {
        for parameterization in [
            RotationParameterization::AngleAxis,
            RotationParameterization::Quaternion,
        ] {
            let camera = sample_camera(parameterization)?;
            assert_eq!(camera.plus(&CameraTangent::zeros()), camera);
        }
        let point = PointBlock::new(Vector3::new(1.0, -2.0, 3.5));
        assert_eq!(point.plus(&Vector3::zeros()), point);
        Ok(())
    }

    #[test]
    fn test_plus_is_additive_for_intrinsics() -> ManifoldResult<()> {
        let camera = sample_camera(RotationParameterization::AngleAxis)?;
        let mut delta = CameraTangent::zeros();
        delta[3] = 0.5;
        delta[6] = 2.0;
        delta[8] = 1e-3;
        let updated = camera.plus(&delta);
        assert_eq!(updated.orientation, camera.orientation);
        assert!((updated.translation.x - camera.translation.x - 0.5).abs() < TOLERANCE);
        assert_eq!(updated.focal_length, 502.0);
        assert!((updated.k2 - camera.k2 - 1e-3).abs() < TOLERANCE);
        Ok(())
    }
}
