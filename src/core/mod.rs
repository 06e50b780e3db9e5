//! Core bundle adjustment model.
//!
//! - Camera and point parameter blocks ([`camera`])
//! - BAL projection model and its analytic derivatives ([`projection`])
//! - Analytic and numeric per-observation Jacobians ([`jacobian`])
//! - Robust loss functions and the Triggs corrector ([`loss_functions`], [`corrector`])
//! - Robustified reprojection residuals ([`residual_block`])
//! - The problem container and its parallel evaluation ([`problem`])

pub mod camera;
pub mod corrector;
pub mod jacobian;
pub mod loss_functions;
pub mod problem;
pub mod projection;
pub mod residual_block;

use crate::manifold::ManifoldError;
use thiserror::Error;
use tracing::error;

/// Errors raised while building or reading back a problem.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProblemError {
    /// An observation refers to a camera or point that does not exist
    #[error(
        "Malformed observation {observation}: camera {camera_index} (of {num_cameras}), point {point_index} (of {num_points})"
    )]
    MalformedObservation {
        observation: usize,
        camera_index: usize,
        point_index: usize,
        num_cameras: usize,
        num_points: usize,
    },

    /// The flat parameter array does not match the block layout
    #[error("Parameter count mismatch: expected {expected} values, got {actual}")]
    ParameterCountMismatch { expected: usize, actual: usize },

    /// A measured pixel or a parameter value is NaN or infinite
    #[error("Non-finite value in {0}")]
    NonFiniteValue(String),

    /// Robust loss created with an invalid scale
    #[error("Invalid loss scale {0}: must be positive and finite")]
    InvalidLossScale(f64),

    /// Bad rotation parameters inside a camera block
    #[error("Invalid camera {camera}: {source}")]
    InvalidCamera {
        camera: usize,
        #[source]
        source: ManifoldError,
    },
}

impl ProblemError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Errors raised by the projection of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ProjectionError {
    /// The point is at or behind the camera center
    #[error("Degenerate projection: point depth {depth:.3e} is not in front of the camera")]
    DegenerateProjection { depth: f64 },
}

pub type ProblemResult<T> = Result<T, ProblemError>;
