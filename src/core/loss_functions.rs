//! Robust loss functions for outlier rejection.
//!
//! With a robust loss ρ the cost of an observation with residual `r` becomes
//! `½·ρ(‖r‖²)` instead of `½·‖r‖²`. Each loss implements [`Loss`], which
//! evaluates:
//! - **ρ(s)**: the robust cost value
//! - **ρ'(s)**: first derivative (the IRLS weight)
//! - **ρ''(s)**: second derivative (used by the [`Corrector`])
//!
//! at `s = ‖r‖²`.
//!
//! [`Corrector`]: super::corrector::Corrector
//!
//! # Example
//!
//! ```
//! use apex_ba::core::loss_functions::{HuberLoss, Loss};
//!
//! let huber = HuberLoss::new(1.0)?;
//! assert_eq!(huber.evaluate(0.5), [0.5, 1.0, 0.0]);
//!
//! let [rho, rho_prime, _] = huber.evaluate(9.0);
//! assert_eq!(rho, 5.0); // 2·1·3 - 1
//! assert!(rho_prime < 1.0);
//! # Ok::<(), apex_ba::core::ProblemError>(())
//! ```

use super::{ProblemError, ProblemResult};
use std::fmt;

/// Robust loss evaluated at the squared residual norm.
///
/// Implementations should satisfy ρ(0) = 0, ρ'(0) = 1 so that small residuals
/// behave like ordinary least squares.
pub trait Loss: Send + Sync {
    /// Returns `[ρ(s), ρ'(s), ρ''(s)]` for `s = ‖r‖² ≥ 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// Huber loss: quadratic for inliers, linear for outliers.
///
/// ```text
/// ρ(s)   = s              if s ≤ δ²
///        = 2δ√s − δ²      otherwise
/// ρ'(s)  = 1              if s ≤ δ²
///        = δ/√s           otherwise
/// ρ''(s) = 0              if s ≤ δ²
///        = −δ/(2·s^(3/2)) otherwise
/// ```
///
/// For every `s > δ²`, `ρ(s) < s` since `s − ρ(s) = (√s − δ)²`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    /// `scale` is the threshold δ (in pixels) between inliers and outliers.
    pub fn new(scale: f64) -> ProblemResult<Self> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(ProblemError::InvalidLossScale(scale));
        }
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy loss: logarithmic growth, stronger suppression than Huber.
///
/// ```text
/// ρ(s)   = δ²·ln(1 + s/δ²)
/// ρ'(s)  = 1 / (1 + s/δ²)
/// ρ''(s) = −ρ'(s)² / δ²
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CauchyLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> ProblemResult<Self> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(ProblemError::InvalidLossScale(scale));
        }
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            inv_scale2: 1.0 / scale2,
        })
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_scale2;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.inv_scale2 * inv * inv,
        ]
    }
}

/// Robust loss selection carried by the solver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RobustLoss {
    /// Plain least squares
    #[default]
    None,
    Huber {
        delta: f64,
    },
    Cauchy {
        scale: f64,
    },
}

impl RobustLoss {
    /// Instantiate the loss, validating its scale. `None` means plain squares.
    pub fn build(&self) -> ProblemResult<Option<Box<dyn Loss>>> {
        Ok(match *self {
            RobustLoss::None => None,
            RobustLoss::Huber { delta } => Some(Box::new(HuberLoss::new(delta)?)),
            RobustLoss::Cauchy { scale } => Some(Box::new(CauchyLoss::new(scale)?)),
        })
    }
}

impl fmt::Display for RobustLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobustLoss::None => write!(f, "none"),
            RobustLoss::Huber { delta } => write!(f, "Huber(δ = {delta})"),
            RobustLoss::Cauchy { scale } => write!(f, "Cauchy(δ = {scale})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_huber_inlier_region() -> ProblemResult<()> {
        let huber = HuberLoss::new(2.0)?;
        assert_eq!(huber.evaluate(3.9), [3.9, 1.0, 0.0]);
        assert_eq!(huber.evaluate(4.0), [4.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_huber_below_quadratic_for_outliers() -> ProblemResult<()> {
        let huber = HuberLoss::new(1.5)?;
        for s in [2.26, 3.0, 10.0, 1e4, 1e8] {
            let [rho, rho1, rho2] = huber.evaluate(s);
            assert!(rho < s, "ρ({s}) = {rho} not below {s}");
            assert!(rho1 < 1.0 && rho1 > 0.0);
            assert!(rho2 < 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_huber_continuous_at_threshold() -> ProblemResult<()> {
        let huber = HuberLoss::new(1.0)?;
        let [below, _, _] = huber.evaluate(1.0);
        let [above, rho1, _] = huber.evaluate(1.0 + 1e-12);
        assert!((below - above).abs() < 1e-9);
        assert!((rho1 - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_huber_derivatives_numerically() -> ProblemResult<()> {
        let huber = HuberLoss::new(0.7)?;
        let s = 5.0;
        let h = 1e-6;
        let [_, rho1, rho2] = huber.evaluate(s);
        let numeric1 = (huber.evaluate(s + h)[0] - huber.evaluate(s - h)[0]) / (2.0 * h);
        let numeric2 = (huber.evaluate(s + h)[1] - huber.evaluate(s - h)[1]) / (2.0 * h);
        assert!((rho1 - numeric1).abs() < 1e-6);
        assert!((rho2 - numeric2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_invalid_scale() {
        assert_eq!(HuberLoss::new(0.0), Err(ProblemError::InvalidLossScale(0.0)));
        assert!(HuberLoss::new(-1.0).is_err());
        assert!(HuberLoss::new(f64::NAN).is_err());
        assert!(CauchyLoss::new(0.0).is_err());
    }

    #[test]
    fn test_cauchy_values() -> ProblemResult<()> {
        let cauchy = CauchyLoss::new(2.0)?;
        let [rho, rho1, rho2] = cauchy.evaluate(4.0);
        assert!((rho - 4.0 * 2.0_f64.ln()).abs() < TOLERANCE);
        assert!((rho1 - 0.5).abs() < TOLERANCE);
        assert!((rho2 + 0.25 * 0.25).abs() < TOLERANCE);
        assert_eq!(cauchy.evaluate(0.0), [0.0, 1.0, -0.25]);
        Ok(())
    }

    #[test]
    fn test_robust_loss_build() -> ProblemResult<()> {
        assert!(RobustLoss::None.build()?.is_none());
        let huber = RobustLoss::Huber { delta: 1.0 }.build()?;
        assert!(huber.is_some());
        assert!(RobustLoss::Huber { delta: -2.0 }.build().is_err());
        Ok(())
    }
}
