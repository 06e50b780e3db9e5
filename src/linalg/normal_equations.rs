//! Block normal equations of the robustified problem.
//!
//! ```text
//! [ B   E ] [δ_c]   [-b_c]
//! [ Eᵀ  C ] [δ_p] = [-b_p]
//! ```
//!
//! `B` is block diagonal over cameras (9×9), `C` block diagonal over points
//! (3×3) and `E` has one 9×3 block per observed (camera, point) pair.
//!
//! Assembly is partitioned so that each rayon task owns the blocks it writes:
//! one task per point fills `C_j`, `b_p_j` and the `E` blocks of that point's
//! edges, one task per camera fills `B_i` and `b_c_i`. Inside a block the
//! observations are summed in a fixed order, so the result does not depend on
//! the thread count.

use crate::core::camera::{CAMERA_DOF, CameraTangent};
use crate::core::problem::{BundleAdjustmentProblem, Linearization};
use nalgebra::{Matrix3, SMatrix, Vector3};
use rayon::prelude::*;

pub type CameraMatrix = SMatrix<f64, CAMERA_DOF, CAMERA_DOF>;
pub type CouplingMatrix = SMatrix<f64, CAMERA_DOF, 3>;

#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// `B_i = Σ J_cᵀ·J_c`
    pub camera_blocks: Vec<CameraMatrix>,
    /// `b_c_i = Σ J_cᵀ·r`
    pub camera_gradients: Vec<CameraTangent>,
    /// `C_j = Σ J_pᵀ·J_p`
    pub point_blocks: Vec<Matrix3<f64>>,
    /// `b_p_j = Σ J_pᵀ·r`
    pub point_gradients: Vec<Vector3<f64>>,
    /// `E_e = Σ J_cᵀ·J_p`, indexed like `ObservationGraph::edges`
    pub couplings: Vec<CouplingMatrix>,
    /// Points with at least one non-degenerate observation
    pub active_points: Vec<bool>,
}

impl NormalEquations {
    pub fn build(problem: &BundleAdjustmentProblem, linearization: &Linearization) -> Self {
        let graph = problem.graph();
        let observations = &linearization.observations;

        type PointPart = (Matrix3<f64>, Vector3<f64>, Vec<CouplingMatrix>, bool);
        let point_parts: Vec<PointPart> = (0..problem.num_points())
            .into_par_iter()
            .map(|point| {
                let edges = graph.point_edges(point);
                let mut block = Matrix3::zeros();
                let mut gradient = Vector3::zeros();
                let mut couplings = Vec::with_capacity(edges.len());
                let mut active = false;

                for edge in edges {
                    let mut coupling = CouplingMatrix::zeros();
                    for &obs in graph.edge_observations(edge) {
                        if let Some(lin) = &observations[obs] {
                            block += lin.point_jacobian.tr_mul(&lin.point_jacobian);
                            gradient += lin.point_jacobian.tr_mul(&lin.residual);
                            coupling += lin.camera_jacobian.tr_mul(&lin.point_jacobian);
                            active = true;
                        }
                    }
                    couplings.push(coupling);
                }
                (block, gradient, couplings, active)
            })
            .collect();

        let camera_parts: Vec<(CameraMatrix, CameraTangent)> = (0..problem.num_cameras())
            .into_par_iter()
            .map(|camera| {
                let mut block = CameraMatrix::zeros();
                let mut gradient = CameraTangent::zeros();
                for &obs in graph.camera_observations(camera) {
                    if let Some(lin) = &observations[obs] {
                        block += lin.camera_jacobian.tr_mul(&lin.camera_jacobian);
                        gradient += lin.camera_jacobian.tr_mul(&lin.residual);
                    }
                }
                (block, gradient)
            })
            .collect();

        let num_edges = graph.edges().len();
        let mut point_blocks = Vec::with_capacity(point_parts.len());
        let mut point_gradients = Vec::with_capacity(point_parts.len());
        let mut couplings = Vec::with_capacity(num_edges);
        let mut active_points = Vec::with_capacity(point_parts.len());
        for (block, gradient, edge_couplings, active) in point_parts {
            point_blocks.push(block);
            point_gradients.push(gradient);
            couplings.extend(edge_couplings);
            active_points.push(active);
        }
        let (camera_blocks, camera_gradients) = camera_parts.into_iter().unzip();

        Self {
            camera_blocks,
            camera_gradients,
            point_blocks,
            point_gradients,
            couplings,
            active_points,
        }
    }

    /// `‖Jᵀr‖∞`
    pub fn gradient_max_norm(&self) -> f64 {
        let camera_max = self
            .camera_gradients
            .iter()
            .map(|g| g.amax())
            .fold(0.0, f64::max);
        let point_max = self
            .point_gradients
            .iter()
            .map(|g| g.amax())
            .fold(0.0, f64::max);
        camera_max.max(point_max)
    }

    /// Largest diagonal entry of `JᵀJ`.
    pub fn max_diagonal(&self) -> f64 {
        let camera_max = self
            .camera_blocks
            .iter()
            .map(|b| b.diagonal().max())
            .fold(0.0, f64::max);
        let point_max = self
            .point_blocks
            .iter()
            .map(|b| b.diagonal().max())
            .fold(0.0, f64::max);
        camera_max.max(point_max)
    }

    /// Decrease of the undamped quadratic model for a step,
    /// `−gᵀδ − ½·δᵀ(JᵀJ)δ`.
    pub fn model_decrease(
        &self,
        problem: &BundleAdjustmentProblem,
        camera_steps: &[CameraTangent],
        point_steps: &[Vector3<f64>],
    ) -> f64 {
        let mut linear = 0.0;
        let mut quadratic = 0.0;

        for ((block, gradient), step) in self
            .camera_blocks
            .iter()
            .zip(&self.camera_gradients)
            .zip(camera_steps)
        {
            linear += gradient.dot(step);
            quadratic += step.dot(&(block * step));
        }
        for ((block, gradient), step) in self
            .point_blocks
            .iter()
            .zip(&self.point_gradients)
            .zip(point_steps)
        {
            linear += gradient.dot(step);
            quadratic += step.dot(&(block * step));
        }
        for (edge, coupling) in problem.graph().edges().iter().zip(&self.couplings) {
            quadratic += 2.0 * camera_steps[edge.camera].dot(&(coupling * point_steps[edge.point]));
        }

        -linear - 0.5 * quadratic
    }
}
