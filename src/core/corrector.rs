//! Triggs correction of residuals and Jacobians for robust losses.
//!
//! Minimizing `½·ρ(‖r‖²)` with Gauss-Newton needs more than a scalar weight on
//! the cost. Following Triggs et al., "Bundle Adjustment: A Modern Synthesis",
//! the residual and Jacobian are rescaled so that the ordinary normal
//! equations `J̃ᵀJ̃·δ = -J̃ᵀr̃` of the corrected quantities equal the
//! second-order model of the robust cost:
//!
//! ```text
//! α  = 1 − √(1 + 2·s·ρ''/ρ')
//! r̃  = √ρ' / (1 − α) · r
//! J̃  = √ρ' · (I − α·r·rᵀ/‖r‖²) · J
//! ```
//!
//! When ρ'' ≤ 0 (Huber and Cauchy outliers) the curvature term would make the
//! model indefinite, so only the `√ρ'` scaling is applied.

use nalgebra::{SMatrix, Vector2};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// `squared_norm` is `‖r‖²` and `rho` the loss evaluated there.
    pub fn new(squared_norm: f64, rho: &[f64; 3]) -> Self {
        let sqrt_rho1 = rho[1].sqrt();

        if squared_norm == 0.0 || rho[2] <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * squared_norm * rho[2] / rho[1];
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / squared_norm,
        }
    }

    pub fn correct_residuals(&self, residual: &mut Vector2<f64>) {
        *residual *= self.residual_scaling;
    }

    /// Must be called with the uncorrected residual.
    pub fn correct_jacobian<const C: usize>(
        &self,
        residual: &Vector2<f64>,
        jacobian: &mut SMatrix<f64, 2, C>,
    ) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let r_t_j = residual.transpose() * *jacobian;
        *jacobian = (*jacobian - residual * r_t_j * self.alpha_sq_norm) * self.sqrt_rho1;
    }
}
