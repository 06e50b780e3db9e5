//! The bundle adjustment problem: parameter blocks, observations and their
//! bipartite structure.
//!
//! Construction validates every observation once. After that the observation
//! graph is immutable and only the parameter blocks change, through
//! [`BundleAdjustmentProblem::apply_step`] and [`BundleAdjustmentProblem::restore`].
//!
//! Evaluation is data parallel over observations. Results are collected in
//! observation order and reduced sequentially, so repeated evaluations of the
//! same state give bit-identical costs.

use super::camera::{CameraBlock, CameraTangent, PointBlock};
use super::residual_block::{LinearizedObservation, ReprojectionResidual};
use super::{ProblemError, ProblemResult, ProjectionError};
use crate::manifold::RotationParameterization;
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::{debug, warn};

/// Degenerate observations beyond this count are only summarized in the log.
const MAX_LOGGED_DEGENERATE: usize = 10;

/// A pixel measurement of a point by a camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub camera_index: usize,
    pub point_index: usize,
    pub measured: Vector2<f64>,
}

impl Observation {
    pub fn new(camera_index: usize, point_index: usize, measured: Vector2<f64>) -> Self {
        Self {
            camera_index,
            point_index,
            measured,
        }
    }
}

/// An observation left out of an evaluation because its point is not in
/// front of the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegenerateObservation {
    pub observation: usize,
    pub camera: usize,
    pub point: usize,
    pub depth: f64,
}

/// A unique (camera, point) pair. Repeated observations of the pair share
/// one coupling block in the normal equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub point: usize,
    pub camera: usize,
}

/// Sparsity structure of the camera/point graph.
#[derive(Debug, Clone)]
pub struct ObservationGraph {
    edges: Vec<Edge>,
    edge_observations: Vec<Vec<usize>>,
    point_edges: Vec<Range<usize>>,
    camera_edges: Vec<Vec<usize>>,
    camera_observations: Vec<Vec<usize>>,
    camera_pairs: Vec<Vec<usize>>,
}

impl ObservationGraph {
    fn build(num_cameras: usize, num_points: usize, observations: &[Observation]) -> Self {
        let mut order: Vec<usize> = (0..observations.len()).collect();
        order.sort_by_key(|&i| {
            let obs = &observations[i];
            (obs.point_index, obs.camera_index, i)
        });

        let mut edges: Vec<Edge> = Vec::new();
        let mut edge_observations: Vec<Vec<usize>> = Vec::new();
        for i in order {
            let obs = &observations[i];
            let edge = Edge {
                point: obs.point_index,
                camera: obs.camera_index,
            };
            match (edges.last(), edge_observations.last_mut()) {
                (Some(last), Some(list)) if *last == edge => list.push(i),
                _ => {
                    edges.push(edge);
                    edge_observations.push(vec![i]);
                }
            }
        }

        let mut point_edges = vec![0..0; num_points];
        let mut start = 0;
        while start < edges.len() {
            let point = edges[start].point;
            let mut end = start;
            while end < edges.len() && edges[end].point == point {
                end += 1;
            }
            point_edges[point] = start..end;
            start = end;
        }

        let mut camera_edges = vec![Vec::new(); num_cameras];
        for (edge_index, edge) in edges.iter().enumerate() {
            camera_edges[edge.camera].push(edge_index);
        }

        let mut camera_observations = vec![Vec::new(); num_cameras];
        for (i, obs) in observations.iter().enumerate() {
            camera_observations[obs.camera_index].push(i);
        }

        let mut pair_sets: Vec<BTreeSet<usize>> = (0..num_cameras)
            .map(|camera| BTreeSet::from([camera]))
            .collect();
        for range in &point_edges {
            let cameras = &edges[range.clone()];
            for (a, first) in cameras.iter().enumerate() {
                for second in &cameras[a..] {
                    pair_sets[first.camera].insert(second.camera);
                }
            }
        }
        let camera_pairs = pair_sets
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();

        Self {
            edges,
            edge_observations,
            point_edges,
            camera_edges,
            camera_observations,
            camera_pairs,
        }
    }

    /// Unique (camera, point) pairs, sorted by point then camera.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_observations(&self, edge: usize) -> &[usize] {
        &self.edge_observations[edge]
    }

    /// Contiguous range of edges that touch `point`.
    pub fn point_edges(&self, point: usize) -> Range<usize> {
        self.point_edges[point].clone()
    }

    /// Edges that touch `camera`, ordered by point.
    pub fn camera_edges(&self, camera: usize) -> &[usize] {
        &self.camera_edges[camera]
    }

    pub fn camera_observations(&self, camera: usize) -> &[usize] {
        &self.camera_observations[camera]
    }

    /// Cameras `k ≥ camera` that share at least one point with `camera`,
    /// including `camera` itself. This is the upper block pattern of the
    /// reduced camera matrix.
    pub fn camera_pairs(&self, camera: usize) -> &[usize] {
        &self.camera_pairs[camera]
    }

    pub fn num_camera_pair_blocks(&self) -> usize {
        self.camera_pairs.iter().map(Vec::len).sum()
    }
}

/// Copy of the mutable parameter state, used to roll back rejected steps.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemState {
    cameras: Vec<CameraBlock>,
    points: Vec<PointBlock>,
}

/// Cost of a parameter state and the observations it had to skip.
#[derive(Debug, Clone, PartialEq)]
pub struct CostEvaluation {
    pub cost: f64,
    pub degenerate: Vec<DegenerateObservation>,
}

/// Per-observation linearization. `None` marks a degenerate observation.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub observations: Vec<Option<LinearizedObservation>>,
    pub cost: f64,
    pub degenerate: Vec<DegenerateObservation>,
}

/// Cameras, points and the observations linking them.
#[derive(Debug, Clone)]
pub struct BundleAdjustmentProblem {
    cameras: Vec<CameraBlock>,
    points: Vec<PointBlock>,
    observations: Vec<Observation>,
    graph: ObservationGraph,
}

impl BundleAdjustmentProblem {
    /// Validate the observations against the blocks and build the graph.
    ///
    /// Any out-of-range index is a [`ProblemError::MalformedObservation`];
    /// duplicate observations are accepted.
    pub fn new(
        cameras: Vec<CameraBlock>,
        points: Vec<PointBlock>,
        observations: Vec<Observation>,
    ) -> ProblemResult<Self> {
        let num_cameras = cameras.len();
        let num_points = points.len();

        for (i, obs) in observations.iter().enumerate() {
            if obs.camera_index >= num_cameras || obs.point_index >= num_points {
                return Err(ProblemError::MalformedObservation {
                    observation: i,
                    camera_index: obs.camera_index,
                    point_index: obs.point_index,
                    num_cameras,
                    num_points,
                }
                .log());
            }
            if !obs.measured.iter().all(|v| v.is_finite()) {
                return Err(ProblemError::NonFiniteValue(format!("observation {i}")).log());
            }
        }
        if let Some(camera) = cameras.iter().position(|c| !c.is_finite()) {
            return Err(ProblemError::NonFiniteValue(format!("camera {camera}")).log());
        }
        if let Some(point) = points.iter().position(|p| !p.is_finite()) {
            return Err(ProblemError::NonFiniteValue(format!("point {point}")).log());
        }

        let graph = ObservationGraph::build(num_cameras, num_points, &observations);
        debug!(
            "Built observation graph: {} cameras, {} points, {} observations, {} edges, {} camera pair blocks",
            num_cameras,
            num_points,
            observations.len(),
            graph.edges().len(),
            graph.num_camera_pair_blocks()
        );

        Ok(Self {
            cameras,
            points,
            observations,
            graph,
        })
    }

    /// Build from the loader layout: all camera blocks (9 or 10 values each)
    /// followed by all points (3 values each).
    pub fn from_flat_parameters(
        num_cameras: usize,
        num_points: usize,
        observations: Vec<Observation>,
        parameters: &[f64],
        parameterization: RotationParameterization,
    ) -> ProblemResult<Self> {
        let camera_size = parameterization.camera_block_size();
        let expected = num_cameras * camera_size + num_points * 3;
        if parameters.len() != expected {
            return Err(ProblemError::ParameterCountMismatch {
                expected,
                actual: parameters.len(),
            }
            .log());
        }

        let (camera_values, point_values) = parameters.split_at(num_cameras * camera_size);
        let cameras = camera_values
            .chunks_exact(camera_size)
            .enumerate()
            .map(|(camera, values)| {
                CameraBlock::from_parameters(values, parameterization)
                    .map_err(|source| ProblemError::InvalidCamera { camera, source })
            })
            .collect::<ProblemResult<Vec<_>>>()?;
        let points = point_values
            .chunks_exact(3)
            .map(|values| PointBlock::new(Vector3::new(values[0], values[1], values[2])))
            .collect();

        Self::new(cameras, points, observations)
    }

    /// Parameters in the same layout as [`Self::from_flat_parameters`].
    pub fn to_flat_parameters(&self) -> Vec<f64> {
        let camera_values: usize = self
            .cameras
            .iter()
            .map(|c| c.parameterization().camera_block_size())
            .sum();
        let mut out = Vec::with_capacity(camera_values + 3 * self.points.len());
        for camera in &self.cameras {
            camera.extend_parameters(&mut out);
        }
        for point in &self.points {
            out.extend_from_slice(point.position.as_slice());
        }
        out
    }

    pub fn cameras(&self) -> &[CameraBlock] {
        &self.cameras
    }

    pub fn points(&self) -> &[PointBlock] {
        &self.points
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn graph(&self) -> &ObservationGraph {
        &self.graph
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Re-express every camera orientation. The represented rotations do
    /// not change.
    pub fn set_rotation_parameterization(&mut self, parameterization: RotationParameterization) {
        for camera in &mut self.cameras {
            *camera = camera.with_parameterization(parameterization);
        }
    }

    /// Euclidean norm of all stored parameter values.
    pub fn parameter_norm(&self) -> f64 {
        let cameras: f64 = self
            .cameras
            .iter()
            .map(|c| c.to_parameters().iter().map(|v| v * v).sum::<f64>())
            .sum();
        let points: f64 = self.points.iter().map(|p| p.position.norm_squared()).sum();
        (cameras + points).sqrt()
    }

    pub fn snapshot(&self) -> ProblemState {
        ProblemState {
            cameras: self.cameras.clone(),
            points: self.points.clone(),
        }
    }

    pub fn restore(&mut self, state: ProblemState) {
        self.cameras = state.cameras;
        self.points = state.points;
    }

    /// Apply a manifold step to every block.
    pub fn apply_step(&mut self, camera_steps: &[CameraTangent], point_steps: &[Vector3<f64>]) {
        debug_assert_eq!(camera_steps.len(), self.cameras.len());
        debug_assert_eq!(point_steps.len(), self.points.len());

        self.cameras
            .par_iter_mut()
            .zip(camera_steps.par_iter())
            .for_each(|(camera, step)| *camera = camera.plus(step));
        self.points
            .par_iter_mut()
            .zip(point_steps.par_iter())
            .for_each(|(point, step)| *point = point.plus(step));
    }

    /// Total robust cost `Σ ½·ρ(‖r‖²)` over non-degenerate observations.
    pub fn evaluate_cost(&self, residual: &ReprojectionResidual) -> CostEvaluation {
        let costs: Vec<Result<f64, ProjectionError>> = self
            .observations
            .par_iter()
            .map(|obs| {
                residual.cost(
                    &self.cameras[obs.camera_index],
                    &self.points[obs.point_index],
                    &obs.measured,
                )
            })
            .collect();

        let mut cost = 0.0;
        let mut degenerate = Vec::new();
        for (i, result) in costs.into_iter().enumerate() {
            match result {
                Ok(c) => cost += c,
                Err(ProjectionError::DegenerateProjection { depth }) => {
                    degenerate.push(self.degenerate_observation(i, depth))
                }
            }
        }
        log_degenerate(&degenerate);

        CostEvaluation { cost, degenerate }
    }

    /// Residuals and Jacobians of every observation, in parallel.
    pub fn linearize(&self, residual: &ReprojectionResidual) -> Linearization {
        let results: Vec<Result<LinearizedObservation, ProjectionError>> = self
            .observations
            .par_iter()
            .map(|obs| {
                residual.linearize(
                    &self.cameras[obs.camera_index],
                    &self.points[obs.point_index],
                    &obs.measured,
                )
            })
            .collect();

        let mut cost = 0.0;
        let mut degenerate = Vec::new();
        let observations = results
            .into_iter()
            .enumerate()
            .map(|(i, result)| match result {
                Ok(linearized) => {
                    cost += linearized.cost;
                    Some(linearized)
                }
                Err(ProjectionError::DegenerateProjection { depth }) => {
                    degenerate.push(self.degenerate_observation(i, depth));
                    None
                }
            })
            .collect();
        log_degenerate(&degenerate);

        Linearization {
            observations,
            cost,
            degenerate,
        }
    }

    fn degenerate_observation(&self, observation: usize, depth: f64) -> DegenerateObservation {
        let obs = &self.observations[observation];
        DegenerateObservation {
            observation,
            camera: obs.camera_index,
            point: obs.point_index,
            depth,
        }
    }
}

fn log_degenerate(degenerate: &[DegenerateObservation]) {
    for d in degenerate.iter().take(MAX_LOGGED_DEGENERATE) {
        warn!(
            "Skipping degenerate observation {} (camera {}, point {}): depth {:.3e}",
            d.observation, d.camera, d.point, d.depth
        );
    }
    if degenerate.len() > MAX_LOGGED_DEGENERATE {
        warn!(
            "{} more degenerate observations skipped",
            degenerate.len() - MAX_LOGGED_DEGENERATE
        );
    }
}
