//! Optimization driver for bundle adjustment problems.
//!
//! The Levenberg-Marquardt driver in [`levenberg_marquardt`] refines a
//! [`BundleAdjustmentProblem`](crate::core::problem::BundleAdjustmentProblem)
//! in place and reports a [`SolverResult`].

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{
    DEFAULT_MARQUARDT_LAMBDA, LevenbergMarquardt, LevenbergMarquardtConfig,
    LevenbergMarquardtSummary,
};

use crate::core::problem::DegenerateObservation;
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Optimizer-specific error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    /// Invalid optimizer configuration
    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),

    /// Cost became NaN or infinite
    #[error("Non-finite cost {cost} at iteration {iteration}")]
    NonFiniteCost { iteration: usize, cost: f64 },

    /// Too many damped steps in a row failed to decrease the cost
    #[error(
        "Step rejected repeatedly at iteration {iteration}: {rejections} consecutive rejections, cost {cost:.6e}, lambda {lambda:.3e}"
    )]
    StepRejectedRepeatedly {
        iteration: usize,
        cost: f64,
        lambda: f64,
        rejections: usize,
    },

    /// A point block could not be inverted during elimination
    #[error("Singular point block {point} at iteration {iteration}")]
    SingularPointBlock { point: usize, iteration: usize },

    /// Dedicated rayon pool could not be created
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Tolerance that ended a converged solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    /// `‖Jᵀr‖∞` below the gradient tolerance
    GradientTolerance,
    /// Relative cost decrease of an accepted step below the cost tolerance
    CostTolerance,
    /// Accepted step small relative to the parameters
    ParameterTolerance,
}

impl fmt::Display for ConvergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceReason::GradientTolerance => write!(f, "gradient tolerance reached"),
            ConvergenceReason::CostTolerance => write!(f, "cost tolerance reached"),
            ConvergenceReason::ParameterTolerance => write!(f, "parameter tolerance reached"),
        }
    }
}

/// Non-failing outcome of a solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    Converged(ConvergenceReason),
    /// Maximum number of iterations reached before any tolerance
    IterationBudgetExhausted,
    /// Time budget reached before any tolerance
    Timeout,
}

impl OptimizationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, OptimizationStatus::Converged(_))
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged(reason) => write!(f, "Converged ({reason})"),
            OptimizationStatus::IterationBudgetExhausted => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Result of a solve. The problem itself holds the refined parameters.
#[derive(Debug, Clone)]
pub struct SolverResult {
    pub status: OptimizationStatus,
    pub summary: LevenbergMarquardtSummary,
    /// Observations skipped at the final accepted state
    pub degenerate_observations: Vec<DegenerateObservation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = OptimizationStatus::Converged(ConvergenceReason::CostTolerance);
        assert!(status.is_converged());
        assert_eq!(status.to_string(), "Converged (cost tolerance reached)");
        assert!(!OptimizationStatus::IterationBudgetExhausted.is_converged());
        assert!(!OptimizationStatus::Timeout.is_converged());
    }

    #[test]
    fn test_singular_point_error_display() {
        let error = OptimizerError::SingularPointBlock {
            point: 17,
            iteration: 2,
        };
        let message = error.to_string();
        assert!(message.contains("point block 17"));
        assert!(message.contains("iteration 2"));
    }
}
