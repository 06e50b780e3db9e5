//! Dataset input and output.
//!
//! - [`bal`]: Bundle Adjustment in the Large text files, plus normalization
//!   and perturbation of loaded datasets
//! - [`ply`]: ASCII point cloud export of camera centers and points

pub mod bal;
pub mod ply;

pub use bal::{BalCamera, BalDataset, BalLoader, BalObservation, BalPoint, BalWriter};
pub use ply::PlyWriter;

use thiserror::Error;
use tracing::error;

/// Errors that can occur while reading or writing datasets
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number format at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Missing required fields at line {line}")]
    MissingFields { line: usize },

    /// Dataset content cannot support the requested operation
    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl IoError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with extra context
    #[must_use]
    pub fn log_with_source<C: std::fmt::Display>(self, context: C) -> Self {
        error!("{} | {}", self, context);
        self
    }
}
