//! Error types for the apex-ba library
//!
//! Every module defines its own `thiserror` enum. `ApexBaError` wraps them so
//! that applications can use a single `?`-friendly type without losing the
//! structured context (indices, costs, damping) carried by each variant.

use crate::{
    core::{ProblemError, ProjectionError},
    io::IoError,
    linalg::LinAlgError,
    manifold::ManifoldError,
    optimizer::OptimizerError,
};
use thiserror::Error;

/// Main result type used throughout the apex-ba library
pub type ApexBaResult<T> = Result<T, ApexBaError>;

/// Main error type for the apex-ba library
#[derive(Debug, Error)]
pub enum ApexBaError {
    /// Problem construction errors (malformed observations, bad parameter arrays)
    #[error(transparent)]
    Problem(#[from] ProblemError),

    /// Projection of a single observation failed
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// Manifold operations errors
    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    /// Linear algebra related errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Solver related errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// File loading and writing errors
    #[error(transparent)]
    Io(#[from] IoError),
}
