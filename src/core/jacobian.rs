//! Per-observation Jacobians of the reprojection.
//!
//! Two interchangeable strategies produce the same `(2×9, 2×3)` block pair:
//! the closed form from [`projection::project_with_jacobians`] and central
//! differences taken through the manifold `plus` of each block. Both are
//! evaluated at the current parameters and never mutate them.
//!
//! [`projection::project_with_jacobians`]: super::projection::project_with_jacobians

use super::ProjectionError;
use super::camera::{CAMERA_DOF, CameraBlock, CameraTangent, POINT_DOF, PointBlock};
use super::projection::{CameraJacobian, PointJacobian, project, project_with_jacobians};
use nalgebra::{Vector2, Vector3};

/// Step used by the central-difference Jacobian.
pub const NUMERIC_DIFF_STEP: f64 = 1e-6;

/// How the per-observation derivative blocks are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JacobianMode {
    #[default]
    Analytic,
    /// Central differences, two projections per parameter
    Numeric,
}

/// Projection and both derivative blocks of a single observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionJacobians {
    pub projected: Vector2<f64>,
    pub camera: CameraJacobian,
    pub point: PointJacobian,
}

impl JacobianMode {
    pub fn evaluate(
        self,
        camera: &CameraBlock,
        point: &PointBlock,
    ) -> Result<ProjectionJacobians, ProjectionError> {
        match self {
            JacobianMode::Analytic => {
                let (projected, camera_jacobian, point_jacobian) =
                    project_with_jacobians(camera, point)?;
                Ok(ProjectionJacobians {
                    projected,
                    camera: camera_jacobian,
                    point: point_jacobian,
                })
            }
            JacobianMode::Numeric => numeric_jacobians(camera, point),
        }
    }
}

/// Central differences through `CameraBlock::plus` and `PointBlock::plus`.
///
/// A perturbed evaluation that crosses the depth limit makes the whole
/// observation degenerate.
pub fn numeric_jacobians(
    camera: &CameraBlock,
    point: &PointBlock,
) -> Result<ProjectionJacobians, ProjectionError> {
    let projected = project(camera, point)?;
    let scale = 1.0 / (2.0 * NUMERIC_DIFF_STEP);

    let mut camera_jacobian = CameraJacobian::zeros();
    for i in 0..CAMERA_DOF {
        let mut delta = CameraTangent::zeros();
        delta[i] = NUMERIC_DIFF_STEP;
        let forward = project(&camera.plus(&delta), point)?;
        let backward = project(&camera.plus(&-delta), point)?;
        camera_jacobian.set_column(i, &((forward - backward) * scale));
    }

    let mut point_jacobian = PointJacobian::zeros();
    for i in 0..POINT_DOF {
        let mut delta = Vector3::zeros();
        delta[i] = NUMERIC_DIFF_STEP;
        let forward = project(camera, &point.plus(&delta))?;
        let backward = project(camera, &point.plus(&-delta))?;
        point_jacobian.set_column(i, &((forward - backward) * scale));
    }

    Ok(ProjectionJacobians {
        projected,
        camera: camera_jacobian,
        point: point_jacobian,
    })
}
