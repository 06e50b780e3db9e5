//! # Apex BA
//!
//! Sparse bundle adjustment for structure-from-motion backends.
//!
//! The crate refines camera poses, intrinsics and 3D landmarks so that the
//! projected landmarks agree with their 2D pixel observations. It is built
//! around the bipartite camera/point structure of the problem:
//!
//! - **Manifolds**: SO(3) and the camera orientation, stored either as an
//!   angle-axis vector or as a unit quaternion, always updated on the 3-DOF
//!   tangent space.
//! - **Core**: camera and point parameter blocks, the BAL projection model,
//!   robust losses with Triggs correction and the per-observation Jacobians.
//! - **Linear algebra**: block normal equations and the Schur-complement
//!   solver that eliminates points before a sparse Cholesky solve on cameras.
//! - **Optimizer**: the Levenberg-Marquardt state machine.
//! - **IO**: BAL dataset loading and writing, PLY export, normalization and
//!   perturbation of datasets.
//!
//! ## Example
//!
//! ```no_run
//! use apex_ba::core::problem::BundleAdjustmentProblem;
//! use apex_ba::io::BalLoader;
//! use apex_ba::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dataset = BalLoader::load("problem-49-7776-pre.txt")?;
//! let config = LevenbergMarquardtConfig::new()
//!     .with_max_iterations(40)
//!     .with_huber_delta(1.0);
//! let mut problem =
//!     BundleAdjustmentProblem::from_dataset(&dataset, config.rotation_parameterization())?;
//!
//! let result = LevenbergMarquardt::with_config(config).minimize(&mut problem)?;
//! println!("{}", result.summary);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod io;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;

pub use error::{ApexBaError, ApexBaResult};
pub use logger::{init_logger, init_logger_with_level};
