//! Levenberg-Marquardt driver for bundle adjustment.
//!
//! One solve walks an explicit state machine:
//!
//! ```text
//! Initializing → Evaluating → Solving → Accepting ─┬→ Evaluating   (step accepted)
//!                    │           ↑          │      └→ Converged    (cost / step tolerance)
//!                    │           └──────────┘         (step rejected, λ increased)
//!                    └→ Converged (gradient tolerance, iteration or time budget)
//! ```
//!
//! Each accepted step relinearizes the problem. A rejected step restores the
//! parameter snapshot, increases λ and re-solves the same linearization, so
//! rejections do not count as iterations. A rejected step that already meets
//! the step or cost tolerance ends the solve as converged at the snapshot.
//! A rejection at λ = 0 restarts λ from the damping heuristic. Too many
//! rejections in a row, or λ above its upper bound, end the solve with
//! [`OptimizerError::StepRejectedRepeatedly`] and the problem left at the last
//! accepted state.
//!
//! All iteration state (λ, counters, normal equations, the symbolic
//! factorization) is local to [`LevenbergMarquardt::minimize`], so one solver
//! can be shared between threads and problems.

use crate::core::jacobian::JacobianMode;
use crate::core::loss_functions::RobustLoss;
use crate::core::problem::{BundleAdjustmentProblem, DegenerateObservation};
use crate::core::residual_block::ReprojectionResidual;
use crate::linalg::{DampingMode, LinAlgError, NormalEquations, SchurComplementSolver, SchurStep};
use crate::manifold::RotationParameterization;
use crate::optimizer::{
    ConvergenceReason, OptimizationStatus, OptimizerError, OptimizerResult, SolverResult,
};
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Initial λ for Marquardt damping when none is configured.
pub const DEFAULT_MARQUARDT_LAMBDA: f64 = 1e-4;
/// `τ` of the initial λ heuristic `τ·max diag(JᵀJ)` for identity damping.
pub const INITIAL_LAMBDA_TAU: f64 = 1e-5;

/// Configuration of a Levenberg-Marquardt solve.
#[derive(Debug, Clone, PartialEq)]
pub struct LevenbergMarquardtConfig {
    /// Accepted steps before giving up
    pub max_iterations: usize,
    /// Starting damping, `None` for the heuristic
    pub initial_lambda: Option<f64>,
    /// λ is divided by this on acceptance and multiplied on rejection
    pub lambda_up_down_factor: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub max_consecutive_rejections: usize,
    pub robust_loss: RobustLoss,
    pub cost_tolerance_relative: f64,
    /// Bound on `‖Jᵀr‖∞`
    pub gradient_tolerance_absolute: f64,
    /// Bound on `‖δ‖ / (‖x‖ + tol)`
    pub parameter_tolerance: f64,
    pub use_quaternion_rotation: bool,
    pub use_analytic_jacobian: bool,
    pub damping_mode: DampingMode,
    pub timeout: Option<Duration>,
    /// Size of a dedicated rayon pool, `None` for the global pool
    pub num_threads: Option<usize>,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            initial_lambda: None,
            lambda_up_down_factor: 10.0,
            lambda_min: 1e-16,
            lambda_max: 1e16,
            max_consecutive_rejections: 10,
            robust_loss: RobustLoss::Huber { delta: 1.0 },
            cost_tolerance_relative: 1e-6,
            gradient_tolerance_absolute: 1e-10,
            parameter_tolerance: 1e-8,
            use_quaternion_rotation: false,
            use_analytic_jacobian: true,
            damping_mode: DampingMode::Marquardt,
            timeout: None,
            num_threads: None,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = Some(lambda);
        self
    }

    pub fn with_lambda_up_down_factor(mut self, factor: f64) -> Self {
        self.lambda_up_down_factor = factor;
        self
    }

    pub fn with_lambda_bounds(mut self, min: f64, max: f64) -> Self {
        self.lambda_min = min;
        self.lambda_max = max;
        self
    }

    pub fn with_max_consecutive_rejections(mut self, rejections: usize) -> Self {
        self.max_consecutive_rejections = rejections;
        self
    }

    pub fn with_robust_loss(mut self, robust_loss: RobustLoss) -> Self {
        self.robust_loss = robust_loss;
        self
    }

    /// Huber loss with threshold `delta` in pixels.
    pub fn with_huber_delta(mut self, delta: f64) -> Self {
        self.robust_loss = RobustLoss::Huber { delta };
        self
    }

    pub fn with_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.cost_tolerance_relative = tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance_absolute = tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, tolerance: f64) -> Self {
        self.parameter_tolerance = tolerance;
        self
    }

    pub fn with_quaternion_rotation(mut self, use_quaternion: bool) -> Self {
        self.use_quaternion_rotation = use_quaternion;
        self
    }

    pub fn with_analytic_jacobian(mut self, analytic: bool) -> Self {
        self.use_analytic_jacobian = analytic;
        self
    }

    pub fn with_damping_mode(mut self, damping_mode: DampingMode) -> Self {
        self.damping_mode = damping_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn rotation_parameterization(&self) -> RotationParameterization {
        if self.use_quaternion_rotation {
            RotationParameterization::Quaternion
        } else {
            RotationParameterization::AngleAxis
        }
    }

    pub fn jacobian_mode(&self) -> JacobianMode {
        if self.use_analytic_jacobian {
            JacobianMode::Analytic
        } else {
            JacobianMode::Numeric
        }
    }

    pub fn validate(&self) -> OptimizerResult<()> {
        let invalid = |message: String| Err(OptimizerError::InvalidConfig(message).log());

        if let Some(lambda) = self.initial_lambda {
            if !lambda.is_finite() || lambda < 0.0 {
                return invalid(format!("initial lambda must be finite and >= 0, got {lambda}"));
            }
        }
        if !(self.lambda_up_down_factor > 1.0) || !self.lambda_up_down_factor.is_finite() {
            return invalid(format!(
                "lambda factor must be finite and > 1, got {}",
                self.lambda_up_down_factor
            ));
        }
        if !(self.lambda_min >= 0.0 && self.lambda_min <= self.lambda_max) {
            return invalid(format!(
                "lambda bounds must satisfy 0 <= min <= max, got [{}, {}]",
                self.lambda_min, self.lambda_max
            ));
        }
        for (name, value) in [
            ("cost tolerance", self.cost_tolerance_relative),
            ("gradient tolerance", self.gradient_tolerance_absolute),
            ("parameter tolerance", self.parameter_tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be finite and >= 0, got {value}"));
            }
        }
        if self.num_threads == Some(0) {
            return invalid("thread count must be positive".to_string());
        }
        self.robust_loss
            .build()
            .map_err(|e| OptimizerError::InvalidConfig(e.to_string()).log())?;
        Ok(())
    }
}

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Accepted steps
    pub iterations: usize,
    pub successful_steps: usize,
    /// Rejected steps, including failed factorizations
    pub unsuccessful_steps: usize,
    pub final_lambda: f64,
    pub average_cost_reduction: f64,
    pub max_gradient_norm: f64,
    pub final_gradient_norm: f64,
    pub max_step_norm: f64,
    pub final_step_norm: f64,
    /// Observations skipped at the final accepted state
    pub degenerate_observations: usize,
    pub total_time: Duration,
    pub average_time_per_iteration: Duration,
}

impl fmt::Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attempts = (self.successful_steps + self.unsuccessful_steps).max(1) as f64;
        writeln!(f, "=== Levenberg-Marquardt Optimization Summary ===")?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / attempts
        )?;
        writeln!(
            f,
            "Unsuccessful steps:        {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / attempts
        )?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_lambda)?;
        writeln!(
            f,
            "Average cost reduction:    {:.6e}",
            self.average_cost_reduction
        )?;
        writeln!(f, "Max gradient norm:         {:.6e}", self.max_gradient_norm)?;
        writeln!(f, "Final gradient norm:       {:.6e}", self.final_gradient_norm)?;
        writeln!(f, "Max step norm:             {:.6e}", self.max_step_norm)?;
        writeln!(f, "Final step norm:           {:.6e}", self.final_step_norm)?;
        writeln!(
            f,
            "Degenerate observations:   {}",
            self.degenerate_observations
        )?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        writeln!(
            f,
            "Average time per iteration: {:?}",
            self.average_time_per_iteration
        )?;
        Ok(())
    }
}

enum SolverState {
    Initializing,
    Evaluating,
    Solving,
    Accepting(SchurStep),
    Converged(OptimizationStatus),
    Failed(OptimizerError),
}

impl SolverState {
    fn name(&self) -> &'static str {
        match self {
            SolverState::Initializing => "Initializing",
            SolverState::Evaluating => "Evaluating",
            SolverState::Solving => "Solving",
            SolverState::Accepting(_) => "Accepting",
            SolverState::Converged(_) => "Converged",
            SolverState::Failed(_) => "Failed",
        }
    }
}

/// Last accepted parameter state and its linearization.
struct Iterate {
    cost: f64,
    degenerate: Vec<DegenerateObservation>,
    /// `None` until the state has been relinearized
    equations: Option<NormalEquations>,
}

#[derive(Default)]
struct Statistics {
    successful_steps: usize,
    unsuccessful_steps: usize,
    consecutive_rejections: usize,
    max_gradient_norm: f64,
    final_gradient_norm: f64,
    max_step_norm: f64,
    final_step_norm: f64,
}

/// Levenberg-Marquardt solver with Schur-complement steps.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Refine `problem` in place.
    ///
    /// Cameras are re-expressed in the configured rotation parameterization
    /// first. On error the problem holds the last accepted parameters.
    pub fn minimize(&self, problem: &mut BundleAdjustmentProblem) -> OptimizerResult<SolverResult> {
        self.config.validate()?;

        match self.config.num_threads {
            Some(num_threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .map_err(|e| OptimizerError::ThreadPool(e.to_string()).log())?;
                pool.install(|| self.run(problem))
            }
            None => self.run(problem),
        }
    }

    fn run(&self, problem: &mut BundleAdjustmentProblem) -> OptimizerResult<SolverResult> {
        let config = &self.config;
        let start = Instant::now();

        problem.set_rotation_parameterization(config.rotation_parameterization());
        let residual = ReprojectionResidual::new(&config.robust_loss, config.jacobian_mode())
            .map_err(|e| OptimizerError::InvalidConfig(e.to_string()).log())?;
        let mut solver = SchurComplementSolver::new(config.damping_mode);

        info!(
            "Starting Levenberg-Marquardt: {} cameras, {} points, {} observations, rotation {}, loss {}, damping {}",
            problem.num_cameras(),
            problem.num_points(),
            problem.num_observations(),
            config.rotation_parameterization(),
            config.robust_loss,
            config.damping_mode
        );

        let mut stats = Statistics::default();
        let mut iterate = Iterate {
            cost: 0.0,
            degenerate: Vec::new(),
            equations: None,
        };
        let mut initial_cost = 0.0;
        let mut lambda = 0.0;
        let mut iteration = 0;
        let mut state = SolverState::Initializing;

        let status = loop {
            let previous = state.name();
            let next = match state {
                SolverState::Initializing => {
                    let linearization = problem.linearize(&residual);
                    let equations = NormalEquations::build(problem, &linearization);
                    lambda = self.initial_lambda(&equations);
                    initial_cost = linearization.cost;
                    iterate = Iterate {
                        cost: linearization.cost,
                        degenerate: linearization.degenerate,
                        equations: Some(equations),
                    };
                    debug!(
                        "Initial cost {:.6e}, initial lambda {:.3e}",
                        initial_cost, lambda
                    );
                    SolverState::Evaluating
                }

                SolverState::Evaluating => {
                    let equations = match iterate.equations.take() {
                        Some(equations) => equations,
                        None => {
                            let linearization = problem.linearize(&residual);
                            let equations = NormalEquations::build(problem, &linearization);
                            iterate.degenerate = linearization.degenerate;
                            equations
                        }
                    };

                    let gradient_norm = equations.gradient_max_norm();
                    stats.max_gradient_norm = stats.max_gradient_norm.max(gradient_norm);
                    stats.final_gradient_norm = gradient_norm;
                    iterate.equations = Some(equations);

                    if !iterate.cost.is_finite() || !gradient_norm.is_finite() {
                        SolverState::Failed(OptimizerError::NonFiniteCost {
                            iteration,
                            cost: iterate.cost,
                        })
                    } else if gradient_norm <= config.gradient_tolerance_absolute {
                        SolverState::Converged(OptimizationStatus::Converged(
                            ConvergenceReason::GradientTolerance,
                        ))
                    } else if iteration >= config.max_iterations {
                        SolverState::Converged(OptimizationStatus::IterationBudgetExhausted)
                    } else if config.timeout.is_some_and(|t| start.elapsed() >= t) {
                        SolverState::Converged(OptimizationStatus::Timeout)
                    } else {
                        SolverState::Solving
                    }
                }

                SolverState::Solving => {
                    let Some(equations) = &iterate.equations else {
                        return Err(OptimizerError::InvalidConfig(
                            "solving without a linearization".to_string(),
                        )
                        .log());
                    };
                    match solver.solve(problem.graph(), equations, lambda) {
                        Ok(step) => SolverState::Accepting(step),
                        Err(LinAlgError::SingularPointBlock { point, .. }) => {
                            SolverState::Failed(OptimizerError::SingularPointBlock {
                                point,
                                iteration,
                            })
                        }
                        Err(e) => {
                            warn!("Rejecting step at lambda {:.3e}: {}", lambda, e);
                            let cost = iterate.cost;
                            self.reject(&mut stats, &mut lambda, iteration, cost, equations)
                        }
                    }
                }

                SolverState::Accepting(step) => {
                    let Some(equations) = &iterate.equations else {
                        return Err(OptimizerError::InvalidConfig(
                            "accepting without a linearization".to_string(),
                        )
                        .log());
                    };
                    let predicted = equations.model_decrease(problem, &step.cameras, &step.points);
                    let parameter_norm = problem.parameter_norm();
                    let step_norm = step.norm();

                    let snapshot = problem.snapshot();
                    problem.apply_step(&step.cameras, &step.points);
                    let candidate = problem.evaluate_cost(&residual);

                    let decreased = candidate.cost.is_finite() && candidate.cost < iterate.cost;
                    let no_new_degenerate =
                        !introduces_degenerate(&iterate.degenerate, &candidate.degenerate);
                    let tolerance = config.parameter_tolerance;
                    let small_step = step_norm <= tolerance * (parameter_norm + tolerance);

                    if decreased && no_new_degenerate {
                        let actual = iterate.cost - candidate.cost;
                        let relative_decrease = actual / iterate.cost;
                        iteration += 1;
                        stats.successful_steps += 1;
                        stats.consecutive_rejections = 0;
                        stats.max_step_norm = stats.max_step_norm.max(step_norm);
                        stats.final_step_norm = step_norm;
                        lambda = (lambda / config.lambda_up_down_factor).max(config.lambda_min);

                        debug!(
                            "Iteration {}: cost {:.6e} -> {:.6e}, gain ratio {:.3}, step norm {:.3e}, lambda {:.3e}",
                            iteration,
                            iterate.cost,
                            candidate.cost,
                            actual / predicted,
                            step_norm,
                            lambda
                        );

                        iterate = Iterate {
                            cost: candidate.cost,
                            degenerate: candidate.degenerate,
                            equations: None,
                        };

                        if relative_decrease <= config.cost_tolerance_relative {
                            SolverState::Converged(OptimizationStatus::Converged(
                                ConvergenceReason::CostTolerance,
                            ))
                        } else if small_step {
                            SolverState::Converged(OptimizationStatus::Converged(
                                ConvergenceReason::ParameterTolerance,
                            ))
                        } else {
                            SolverState::Evaluating
                        }
                    } else {
                        problem.restore(snapshot);
                        debug!(
                            "Rejected step: cost {:.6e} -> {:.6e}, {} -> {} degenerate observations, lambda {:.3e}",
                            iterate.cost,
                            candidate.cost,
                            iterate.degenerate.len(),
                            candidate.degenerate.len(),
                            lambda
                        );

                        // A rejected step at a minimum still satisfies the tolerances
                        let negligible_change = no_new_degenerate
                            && negligible_cost_change(
                                iterate.cost,
                                candidate.cost,
                                config.cost_tolerance_relative,
                            );
                        if small_step {
                            SolverState::Converged(OptimizationStatus::Converged(
                                ConvergenceReason::ParameterTolerance,
                            ))
                        } else if negligible_change {
                            SolverState::Converged(OptimizationStatus::Converged(
                                ConvergenceReason::CostTolerance,
                            ))
                        } else {
                            let cost = iterate.cost;
                            self.reject(&mut stats, &mut lambda, iteration, cost, equations)
                        }
                    }
                }

                SolverState::Converged(status) => break status,

                SolverState::Failed(error) => return Err(error.log()),
            };

            debug!("LM state: {} -> {}", previous, next.name());
            state = next;
        };

        let total_time = start.elapsed();
        let summary = LevenbergMarquardtSummary {
            initial_cost,
            final_cost: iterate.cost,
            iterations: iteration,
            successful_steps: stats.successful_steps,
            unsuccessful_steps: stats.unsuccessful_steps,
            final_lambda: lambda,
            average_cost_reduction: (initial_cost - iterate.cost) / iteration.max(1) as f64,
            max_gradient_norm: stats.max_gradient_norm,
            final_gradient_norm: stats.final_gradient_norm,
            max_step_norm: stats.max_step_norm,
            final_step_norm: stats.final_step_norm,
            degenerate_observations: iterate.degenerate.len(),
            total_time,
            average_time_per_iteration: total_time / iteration.max(1) as u32,
        };
        info!(
            "Levenberg-Marquardt finished: {} after {} iterations, cost {:.6e} -> {:.6e}",
            status, iteration, initial_cost, iterate.cost
        );

        Ok(SolverResult {
            status,
            summary,
            degenerate_observations: iterate.degenerate,
        })
    }

    fn initial_lambda(&self, equations: &NormalEquations) -> f64 {
        self.config
            .initial_lambda
            .unwrap_or_else(|| self.heuristic_lambda(equations))
    }

    fn heuristic_lambda(&self, equations: &NormalEquations) -> f64 {
        match self.config.damping_mode {
            DampingMode::Identity => INITIAL_LAMBDA_TAU * equations.max_diagonal(),
            DampingMode::Marquardt => DEFAULT_MARQUARDT_LAMBDA,
        }
    }

    /// Count a rejected step and raise λ, failing once the limits are passed.
    ///
    /// A zero λ cannot grow by multiplication and restarts from the heuristic.
    fn reject(
        &self,
        stats: &mut Statistics,
        lambda: &mut f64,
        iteration: usize,
        cost: f64,
        equations: &NormalEquations,
    ) -> SolverState {
        stats.unsuccessful_steps += 1;
        stats.consecutive_rejections += 1;
        *lambda = if *lambda > 0.0 {
            *lambda * self.config.lambda_up_down_factor
        } else {
            self.heuristic_lambda(equations)
                .max(self.config.lambda_min)
                .max(f64::MIN_POSITIVE)
        };

        if stats.consecutive_rejections > self.config.max_consecutive_rejections
            || *lambda > self.config.lambda_max
        {
            SolverState::Failed(OptimizerError::StepRejectedRepeatedly {
                iteration,
                cost,
                lambda: *lambda,
                rejections: stats.consecutive_rejections,
            })
        } else {
            SolverState::Solving
        }
    }
}

/// Whether `candidate` skips an observation that `current` still evaluates.
fn introduces_degenerate(
    current: &[DegenerateObservation],
    candidate: &[DegenerateObservation],
) -> bool {
    let known: HashSet<usize> = current.iter().map(|d| d.observation).collect();
    candidate.iter().any(|d| !known.contains(&d.observation))
}

/// Relative change of the cost below `tolerance`.
fn negligible_cost_change(current: f64, candidate: f64, tolerance: f64) -> bool {
    candidate.is_finite() && (current - candidate).abs() <= tolerance * current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::{CameraBlock, PointBlock};
    use crate::core::problem::Observation;
    use crate::core::projection::project;
    use nalgebra::{Vector2, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Four cameras on an arc looking at a small grid of points, observed
    /// exactly.
    fn exact_scene() -> Result<BundleAdjustmentProblem, Box<dyn std::error::Error>> {
        let mut cameras = Vec::new();
        for i in 0..4 {
            let angle = 0.15 * (i as f64 - 1.5);
            let center = Vector3::new(8.0 * angle.sin(), 0.3 * i as f64, 8.0 * angle.cos());
            // Rotate about y so the optical axis (−z) points at the origin
            cameras.push(CameraBlock::from_angle_axis_and_center(
                Vector3::new(0.0, -angle, 0.0),
                center,
                500.0,
                0.01,
                -0.001,
                RotationParameterization::AngleAxis,
            )?);
        }
        let mut points = Vec::new();
        for x in -2..=2 {
            for y in -1..=1 {
                points.push(PointBlock::new(Vector3::new(
                    0.5 * x as f64,
                    0.5 * y as f64,
                    0.2 * ((x + y) % 2) as f64,
                )));
            }
        }
        let mut observations = Vec::new();
        for (c, camera) in cameras.iter().enumerate() {
            for (p, point) in points.iter().enumerate() {
                observations.push(Observation::new(c, p, project(camera, point)?));
            }
        }
        Ok(BundleAdjustmentProblem::new(cameras, points, observations)?)
    }

    fn perturbed(
        problem: &BundleAdjustmentProblem,
    ) -> Result<BundleAdjustmentProblem, Box<dyn std::error::Error>> {
        let cameras = problem
            .cameras()
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut step = crate::core::camera::CameraTangent::zeros();
                step[0] = 0.002 * (i as f64 - 1.5);
                step[4] = 0.02;
                c.plus(&step)
            })
            .collect();
        let points = problem
            .points()
            .iter()
            .enumerate()
            .map(|(j, p)| p.plus(&(Vector3::new(0.01, -0.02, 0.015) * ((j % 3) as f64 - 1.0))))
            .collect();
        Ok(BundleAdjustmentProblem::new(
            cameras,
            points,
            problem.observations().to_vec(),
        )?)
    }

    #[test]
    fn test_config_defaults() {
        let config = LevenbergMarquardtConfig::default();
        assert_eq!(config.max_iterations, 40);
        assert_eq!(config.initial_lambda, None);
        assert_eq!(config.lambda_up_down_factor, 10.0);
        assert_eq!(config.max_consecutive_rejections, 10);
        assert_eq!(config.robust_loss, RobustLoss::Huber { delta: 1.0 });
        assert_eq!(config.damping_mode, DampingMode::Marquardt);
        assert_eq!(
            config.rotation_parameterization(),
            RotationParameterization::AngleAxis
        );
        assert_eq!(config.jacobian_mode(), JacobianMode::Analytic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            LevenbergMarquardtConfig::new().with_lambda_up_down_factor(1.0),
            LevenbergMarquardtConfig::new().with_lambda_bounds(1.0, 0.1),
            LevenbergMarquardtConfig::new().with_initial_lambda(-1.0),
            LevenbergMarquardtConfig::new().with_huber_delta(0.0),
            LevenbergMarquardtConfig::new().with_num_threads(0),
            LevenbergMarquardtConfig::new().with_cost_tolerance(f64::NAN),
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(OptimizerError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_exact_problem_converges_without_steps() -> TestResult {
        let mut problem = exact_scene()?;
        let before = problem.to_flat_parameters();

        let result = LevenbergMarquardt::new().minimize(&mut problem)?;
        assert_eq!(
            result.status,
            OptimizationStatus::Converged(ConvergenceReason::GradientTolerance)
        );
        assert_eq!(result.summary.successful_steps, 0);
        assert_eq!(result.summary.final_cost, 0.0);
        assert_eq!(problem.to_flat_parameters(), before);
        Ok(())
    }

    #[test]
    fn test_recovers_perturbed_scene() -> TestResult {
        let exact = exact_scene()?;
        let mut problem = perturbed(&exact)?;

        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(100)
            .with_cost_tolerance(1e-12);
        let result = LevenbergMarquardt::with_config(config).minimize(&mut problem)?;

        assert!(result.status.is_converged(), "status {}", result.status);
        assert!(result.summary.successful_steps > 0);
        assert!(result.summary.final_cost < 1e-4 * result.summary.initial_cost);
        assert!(result.degenerate_observations.is_empty());
        Ok(())
    }

    #[test]
    fn test_identity_damping_heuristic() -> TestResult {
        let exact = exact_scene()?;
        let mut problem = perturbed(&exact)?;
        let config = LevenbergMarquardtConfig::new()
            .with_damping_mode(DampingMode::Identity)
            .with_max_iterations(100);
        let result = LevenbergMarquardt::with_config(config).minimize(&mut problem)?;
        assert!(result.summary.final_cost < result.summary.initial_cost);
        Ok(())
    }

    #[test]
    fn test_iteration_budget_reported() -> TestResult {
        let exact = exact_scene()?;
        let mut problem = perturbed(&exact)?;
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(1)
            .with_initial_lambda(10.0);
        let result = LevenbergMarquardt::with_config(config).minimize(&mut problem)?;
        assert_eq!(result.status, OptimizationStatus::IterationBudgetExhausted);
        assert_eq!(result.summary.iterations, 1);
        Ok(())
    }

    #[test]
    fn test_single_observation_point_is_singular_without_damping() -> TestResult {
        let mut problem = BundleAdjustmentProblem::new(
            vec![CameraBlock::from_angle_axis_and_center(
                Vector3::zeros(),
                Vector3::new(0.0, 0.0, 5.0),
                500.0,
                0.0,
                0.0,
                RotationParameterization::AngleAxis,
            )?],
            vec![PointBlock::new(Vector3::new(0.1, 0.2, 0.0))],
            vec![Observation::new(0, 0, Vector2::new(15.0, 15.0))],
        )?;
        let config = LevenbergMarquardtConfig::new()
            .with_damping_mode(DampingMode::Identity)
            .with_initial_lambda(0.0)
            .with_lambda_bounds(0.0, 1e16);
        let result = LevenbergMarquardt::with_config(config).minimize(&mut problem);
        assert_eq!(
            result.err(),
            Some(OptimizerError::SingularPointBlock {
                point: 0,
                iteration: 0
            })
        );
        Ok(())
    }

    fn linearized(
        problem: &BundleAdjustmentProblem,
    ) -> Result<NormalEquations, Box<dyn std::error::Error>> {
        let residual = ReprojectionResidual::new(&RobustLoss::None, JacobianMode::Analytic)?;
        Ok(NormalEquations::build(problem, &problem.linearize(&residual)))
    }

    fn degenerate(observation: usize) -> DegenerateObservation {
        DegenerateObservation {
            observation,
            camera: 0,
            point: observation,
            depth: -1.0,
        }
    }

    #[test]
    fn test_timeout_leaves_problem_untouched() -> TestResult {
        let exact = exact_scene()?;
        let mut problem = perturbed(&exact)?;
        let before = problem.to_flat_parameters();

        let config = LevenbergMarquardtConfig::new().with_timeout(Duration::ZERO);
        let result = LevenbergMarquardt::with_config(config).minimize(&mut problem)?;

        assert_eq!(result.status, OptimizationStatus::Timeout);
        assert_eq!(result.summary.iterations, 0);
        assert_eq!(result.summary.successful_steps, 0);
        assert_eq!(result.summary.final_cost, result.summary.initial_cost);
        assert_eq!(problem.to_flat_parameters(), before);
        Ok(())
    }

    #[test]
    fn test_reject_fails_once_lambda_passes_ceiling() -> TestResult {
        let problem = exact_scene()?;
        let equations = linearized(&problem)?;
        let config = LevenbergMarquardtConfig::new().with_lambda_bounds(0.0, 10.0);
        let solver = LevenbergMarquardt::with_config(config);
        let mut stats = Statistics::default();
        let mut lambda = 0.5;

        let state = solver.reject(&mut stats, &mut lambda, 3, 7.5, &equations);
        assert!(matches!(state, SolverState::Solving));
        assert_eq!(lambda, 5.0);

        match solver.reject(&mut stats, &mut lambda, 3, 7.5, &equations) {
            SolverState::Failed(OptimizerError::StepRejectedRepeatedly {
                iteration,
                cost,
                lambda: failed_lambda,
                rejections,
            }) => {
                assert_eq!(iteration, 3);
                assert_eq!(cost, 7.5);
                assert_eq!(failed_lambda, 50.0);
                assert_eq!(rejections, 2);
            }
            other => panic!("expected a failed state, got {}", other.name()),
        }
        assert_eq!(stats.unsuccessful_steps, 2);
        Ok(())
    }

    #[test]
    fn test_reject_restarts_zero_lambda_from_heuristic() -> TestResult {
        let problem = exact_scene()?;
        let equations = linearized(&problem)?;

        let marquardt = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_initial_lambda(0.0),
        );
        let mut lambda = 0.0;
        let mut stats = Statistics::default();
        let state = marquardt.reject(&mut stats, &mut lambda, 0, 1.0, &equations);
        assert!(matches!(state, SolverState::Solving));
        assert_eq!(lambda, DEFAULT_MARQUARDT_LAMBDA);

        let identity = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new()
                .with_initial_lambda(0.0)
                .with_damping_mode(DampingMode::Identity),
        );
        let mut lambda = 0.0;
        identity.reject(&mut Statistics::default(), &mut lambda, 0, 1.0, &equations);
        assert_eq!(lambda, INITIAL_LAMBDA_TAU * equations.max_diagonal());
        assert!(lambda > 0.0);
        Ok(())
    }

    #[test]
    fn test_degenerate_sets_compared_by_observation() {
        let current = [degenerate(2), degenerate(5)];
        assert!(!introduces_degenerate(&current, &[degenerate(5)]));
        assert!(!introduces_degenerate(&current, &[degenerate(2), degenerate(5)]));
        // Same count, different observation
        assert!(introduces_degenerate(&current, &[degenerate(2), degenerate(7)]));
        assert!(introduces_degenerate(&[], &[degenerate(0)]));
    }

    #[test]
    fn test_negligible_cost_change() {
        assert!(negligible_cost_change(100.0, 100.00001, 1e-6));
        assert!(negligible_cost_change(100.0, 99.99999, 1e-6));
        assert!(!negligible_cost_change(100.0, 99.0, 1e-6));
        assert!(!negligible_cost_change(100.0, f64::NAN, 1e-6));
    }

    #[test]
    fn test_summary_display() {
        let summary = LevenbergMarquardtSummary {
            initial_cost: 100.0,
            final_cost: 1.0,
            iterations: 5,
            successful_steps: 5,
            unsuccessful_steps: 2,
            final_lambda: 1e-6,
            average_cost_reduction: 19.8,
            max_gradient_norm: 10.0,
            final_gradient_norm: 1e-8,
            max_step_norm: 0.5,
            final_step_norm: 1e-9,
            degenerate_observations: 0,
            total_time: Duration::from_millis(10),
            average_time_per_iteration: Duration::from_millis(2),
        };
        let text = summary.to_string();
        assert!(text.starts_with("=== Levenberg-Marquardt Optimization Summary ==="));
        assert!(text.contains("Total iterations:          5"));
        assert!(text.contains("Degenerate observations:   0"));
    }
}
