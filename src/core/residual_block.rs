//! Robustified reprojection residual of a single observation.

use super::ProblemResult;
use super::ProjectionError;
use super::camera::{CameraBlock, PointBlock};
use super::corrector::Corrector;
use super::jacobian::JacobianMode;
use super::loss_functions::{Loss, RobustLoss};
use super::projection::{CameraJacobian, PointJacobian, project};
use nalgebra::Vector2;

/// Residual and derivative blocks after robust correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearizedObservation {
    pub residual: Vector2<f64>,
    pub camera_jacobian: CameraJacobian,
    pub point_jacobian: PointJacobian,
    /// `½·ρ(‖r‖²)` of the uncorrected residual
    pub cost: f64,
}

/// `project(camera, point) − measured`, weighted by an optional robust loss.
pub struct ReprojectionResidual {
    loss: Option<Box<dyn Loss>>,
    jacobian_mode: JacobianMode,
}

impl ReprojectionResidual {
    pub fn new(robust_loss: &RobustLoss, jacobian_mode: JacobianMode) -> ProblemResult<Self> {
        Ok(Self {
            loss: robust_loss.build()?,
            jacobian_mode,
        })
    }

    pub fn jacobian_mode(&self) -> JacobianMode {
        self.jacobian_mode
    }

    /// Raw reprojection error in pixels.
    pub fn residual(
        camera: &CameraBlock,
        point: &PointBlock,
        measured: &Vector2<f64>,
    ) -> Result<Vector2<f64>, ProjectionError> {
        Ok(project(camera, point)? - measured)
    }

    /// `½·ρ(s)`, or `½·s` without a loss.
    #[inline]
    pub fn robust_cost(&self, squared_norm: f64) -> f64 {
        match &self.loss {
            Some(loss) => 0.5 * loss.evaluate(squared_norm)[0],
            None => 0.5 * squared_norm,
        }
    }

    pub fn cost(
        &self,
        camera: &CameraBlock,
        point: &PointBlock,
        measured: &Vector2<f64>,
    ) -> Result<f64, ProjectionError> {
        let residual = Self::residual(camera, point, measured)?;
        Ok(self.robust_cost(residual.norm_squared()))
    }

    /// Residual and Jacobians with the Triggs correction applied.
    pub fn linearize(
        &self,
        camera: &CameraBlock,
        point: &PointBlock,
        measured: &Vector2<f64>,
    ) -> Result<LinearizedObservation, ProjectionError> {
        let jacobians = self.jacobian_mode.evaluate(camera, point)?;
        let mut residual = jacobians.projected - measured;
        let mut camera_jacobian = jacobians.camera;
        let mut point_jacobian = jacobians.point;
        let squared_norm = residual.norm_squared();

        let cost = match &self.loss {
            Some(loss) => {
                let rho = loss.evaluate(squared_norm);
                let corrector = Corrector::new(squared_norm, &rho);
                corrector.correct_jacobian(&residual, &mut camera_jacobian);
                corrector.correct_jacobian(&residual, &mut point_jacobian);
                corrector.correct_residuals(&mut residual);
                0.5 * rho[0]
            }
            None => 0.5 * squared_norm,
        };

        Ok(LinearizedObservation {
            residual,
            camera_jacobian,
            point_jacobian,
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{Orientation, RotationParameterization};
    use nalgebra::Vector3;

    fn camera() -> CameraBlock {
        CameraBlock::new(
            Orientation::identity(RotationParameterization::AngleAxis),
            Vector3::zeros(),
            100.0,
            0.0,
            0.0,
        )
    }

    #[test]
    fn test_cost_without_loss() -> Result<(), Box<dyn std::error::Error>> {
        let residual = ReprojectionResidual::new(&RobustLoss::None, JacobianMode::Analytic)?;
        let point = PointBlock::new(Vector3::new(0.0, 0.0, -1.0));
        let cost = residual.cost(&camera(), &point, &Vector2::new(3.0, 4.0))?;
        assert_eq!(cost, 12.5);
        Ok(())
    }

    #[test]
    fn test_huber_cost_below_quadratic() -> Result<(), Box<dyn std::error::Error>> {
        let plain = ReprojectionResidual::new(&RobustLoss::None, JacobianMode::Analytic)?;
        let huber =
            ReprojectionResidual::new(&RobustLoss::Huber { delta: 1.0 }, JacobianMode::Analytic)?;
        let point = PointBlock::new(Vector3::new(0.0, 0.0, -1.0));
        let measured = Vector2::new(3.0, 4.0);

        let plain_cost = plain.cost(&camera(), &point, &measured)?;
        let huber_cost = huber.cost(&camera(), &point, &measured)?;
        assert!(huber_cost < plain_cost);
        // ½·(2·1·5 − 1)
        assert_eq!(huber_cost, 4.5);
        Ok(())
    }

    #[test]
    fn test_linearize_scales_outliers() -> Result<(), Box<dyn std::error::Error>> {
        let plain = ReprojectionResidual::new(&RobustLoss::None, JacobianMode::Analytic)?;
        let huber =
            ReprojectionResidual::new(&RobustLoss::Huber { delta: 1.0 }, JacobianMode::Analytic)?;
        let point = PointBlock::new(Vector3::new(0.1, 0.0, -2.0));
        let measured = Vector2::new(-5.0, 10.0);

        let a = plain.linearize(&camera(), &point, &measured)?;
        let b = huber.linearize(&camera(), &point, &measured)?;
        assert!(b.residual.norm() < a.residual.norm());
        assert!(b.camera_jacobian.norm() < a.camera_jacobian.norm());
        assert!(b.cost < a.cost);
        Ok(())
    }

    #[test]
    fn test_linearize_degenerate() -> Result<(), Box<dyn std::error::Error>> {
        let plain = ReprojectionResidual::new(&RobustLoss::None, JacobianMode::Analytic)?;
        let behind = PointBlock::new(Vector3::new(0.0, 0.0, 1.0));
        let result = plain.linearize(&camera(), &behind, &Vector2::zeros());
        assert!(matches!(
            result,
            Err(ProjectionError::DegenerateProjection { .. })
        ));
        Ok(())
    }
}
