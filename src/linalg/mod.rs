//! Linear algebra for the damped Gauss-Newton step.
//!
//! - [`normal_equations`]: block accumulation of `JᵀJ` and `Jᵀr`, with the
//!   camera/camera, point/point and camera/point blocks kept separate
//! - [`schur`]: elimination of the point blocks and sparse Cholesky
//!   factorization of the reduced camera system (faer)

pub mod normal_equations;
pub mod schur;

pub use normal_equations::NormalEquations;
pub use schur::{DampingMode, SchurComplementSolver, SchurStep};

use thiserror::Error;
use tracing::error;

/// Linear algebra error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinAlgError {
    /// A damped 3×3 point block cannot be inverted
    #[error("Singular point block {point}: smallest eigenvalue {min_eigenvalue:.3e}")]
    SingularPointBlock { point: usize, min_eigenvalue: f64 },

    /// Numeric factorization of the reduced camera matrix failed
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Sparse matrix construction failed
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Block counts of the normal equations do not match the problem
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the error of the underlying library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;
