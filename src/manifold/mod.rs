//! Rotation manifolds used by the camera parameter blocks.
//!
//! Camera orientations live on SO(3). The optimizer never touches the stored
//! representation directly: every update is a 3-vector δω in the tangent space,
//! applied on the left through the exponential map,
//!
//! ```text
//! R_new = Exp(δω) · R_old
//! ```
//!
//! which keeps the tangent dimension at 3 whether the camera stores an
//! angle-axis vector or a unit quaternion.
//!
//! Lie group M,° | size | dim | X ∈ M | Constraint | T_E M         | Exp(T)        | Comp. | Action
//! ------------- | ---- | --- | ----- | ---------- | ------------- | ------------- | ----- | ------
//! Rotation      | 9    | 3   | R     | RᵀR = I    | [θ]x ∈ so(3)  | R = exp([θ]x) | R₁R₂  | Rx
//! 3-sphere      | 4    | 3   | q ∈ H | q*q = 1    | θ/2 ∈ Hp      | q = exp(uθ/2) | q₁q₂  | qxq*

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;
use tracing::error;

pub mod rotation;
pub mod so3;

pub use rotation::{Orientation, RotationParameterization};
pub use so3::SO3;

/// Below this squared angle the exponential and logarithmic maps switch to
/// their first-order Taylor expansions.
pub const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifoldError {
    /// Wrong number of values for the requested rotation parameterization
    #[error("Invalid rotation parameter count: expected {expected}, got {actual}")]
    InvalidParameterCount { expected: usize, actual: usize },

    /// Quaternion coefficients that cannot be normalized
    #[error("Invalid quaternion [w: {w}, x: {x}, y: {y}, z: {z}]: norm must be finite and non-zero")]
    InvalidQuaternion { w: f64, x: f64, y: f64, z: f64 },

    /// Non-finite rotation vector
    #[error("Invalid angle-axis vector: {0:?}")]
    InvalidAngleAxis([f64; 3]),
}

impl ManifoldError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Skew-symmetric matrix `[v]ₓ` such that `[v]ₓ·u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_matches_cross_product() {
        let v = Vector3::new(0.3, -1.2, 2.5);
        let u = Vector3::new(-0.7, 0.4, 1.1);
        let diff = skew(&v) * u - v.cross(&u);
        assert!(diff.norm() < 1e-15);
    }

    #[test]
    fn test_skew_is_antisymmetric() {
        let m = skew(&Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(m, -m.transpose());
    }
}
