//! Schur complement solver for the damped normal equations.
//!
//! With damping `λ·D` added to the diagonal blocks, the point blocks are
//! eliminated:
//!
//! ```text
//! S    = B − E·C⁻¹·Eᵀ
//! b_c' = b_c − E·C⁻¹·b_p
//! S·δ_c = −b_c'
//! δ_p  = −C⁻¹·(b_p + Eᵀ·δ_c)
//! ```
//!
//! `S` has one 9×9 block per camera pair that shares a point. The pattern is
//! fixed by the observation graph, so every block of the pattern is emitted
//! (zeros included) and the symbolic Cholesky factorization is computed once
//! and reused for every λ and every iteration.

use super::normal_equations::{CameraMatrix, CouplingMatrix, NormalEquations};
use super::{LinAlgError, LinAlgResult};
use crate::core::camera::{CAMERA_DOF, CameraTangent};
use crate::core::problem::ObservationGraph;
use faer::sparse::{SparseColMat, Triplet};
use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use nalgebra::{Matrix3, SVector, Vector3};
use rayon::prelude::*;
use tracing::debug;

/// Lower clamp of the Marquardt scaling diagonal.
pub const MIN_DIAGONAL: f64 = 1e-6;
/// Upper clamp of the Marquardt scaling diagonal.
pub const MAX_DIAGONAL: f64 = 1e32;
/// Smallest eigenvalue of a damped point block, relative to its largest,
/// below which the block is treated as singular.
const MIN_EIGENVALUE_THRESHOLD: f64 = 1e-12;
/// Point blocks above this condition number are reported in the debug log.
const CONDITION_THRESHOLD: f64 = 1e10;

/// Scaling `D` of the damping term `λ·D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DampingMode {
    /// `D = I`
    Identity,
    /// `D = diag(JᵀJ)`, clamped to `[MIN_DIAGONAL, MAX_DIAGONAL]`
    #[default]
    Marquardt,
}

impl DampingMode {
    /// Scaling diagonal for a block with the given `JᵀJ` diagonal.
    pub fn damping_diagonal<const N: usize>(self, diagonal: &SVector<f64, N>) -> SVector<f64, N> {
        match self {
            DampingMode::Identity => SVector::repeat(1.0),
            DampingMode::Marquardt => diagonal.map(|d| d.clamp(MIN_DIAGONAL, MAX_DIAGONAL)),
        }
    }
}

impl std::fmt::Display for DampingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DampingMode::Identity => write!(f, "identity"),
            DampingMode::Marquardt => write!(f, "marquardt"),
        }
    }
}

/// Tangent-space step for every camera and point.
#[derive(Debug, Clone, PartialEq)]
pub struct SchurStep {
    pub cameras: Vec<CameraTangent>,
    pub points: Vec<Vector3<f64>>,
}

impl SchurStep {
    pub fn norm(&self) -> f64 {
        let cameras: f64 = self.cameras.iter().map(|c| c.norm_squared()).sum();
        let points: f64 = self.points.iter().map(|p| p.norm_squared()).sum();
        (cameras + points).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.cameras.iter().all(|c| c.iter().all(|v| v.is_finite()))
            && self.points.iter().all(|p| p.iter().all(|v| v.is_finite()))
    }
}

/// Damped point block inverse, `None` for points without active observations.
type PointInverse = Option<Matrix3<f64>>;

/// One block row of the reduced camera system: `(S_ik for k in pairs, b_c'_i)`.
type ReducedRow = (Vec<CameraMatrix>, CameraTangent);

#[derive(Debug, Default)]
pub struct SchurComplementSolver {
    damping_mode: DampingMode,
    symbolic: Option<SymbolicLlt<usize>>,
    /// Dimension and stored entries the cached symbolic factorization belongs to.
    symbolic_key: Option<(usize, usize)>,
}

impl SchurComplementSolver {
    pub fn new(damping_mode: DampingMode) -> Self {
        Self {
            damping_mode,
            symbolic: None,
            symbolic_key: None,
        }
    }

    pub fn damping_mode(&self) -> DampingMode {
        self.damping_mode
    }

    /// Forget the cached symbolic factorization.
    pub fn reset(&mut self) {
        self.symbolic = None;
        self.symbolic_key = None;
    }

    /// Solve `(JᵀJ + λ·D)·δ = −Jᵀr` by eliminating the point blocks.
    ///
    /// Points without active observations get a zero step.
    pub fn solve(
        &mut self,
        graph: &ObservationGraph,
        equations: &NormalEquations,
        lambda: f64,
    ) -> LinAlgResult<SchurStep> {
        if equations.couplings.len() != graph.edges().len() {
            return Err(LinAlgError::DimensionMismatch {
                expected: graph.edges().len(),
                actual: equations.couplings.len(),
            }
            .log());
        }

        let inverses = self.invert_point_blocks(equations, lambda)?;
        let weighted = weighted_couplings(graph, equations, &inverses);
        let rows = self.reduced_rows(graph, equations, &weighted, lambda);

        let cameras = if rows.is_empty() {
            Vec::new()
        } else {
            self.solve_reduced(graph, &rows)?
        };
        let points = back_substitute(graph, equations, &inverses, &cameras);

        Ok(SchurStep { cameras, points })
    }

    fn invert_point_blocks(
        &self,
        equations: &NormalEquations,
        lambda: f64,
    ) -> LinAlgResult<Vec<PointInverse>> {
        let mode = self.damping_mode;
        let inverses: Vec<LinAlgResult<PointInverse>> = equations
            .point_blocks
            .par_iter()
            .zip(equations.active_points.par_iter())
            .enumerate()
            .map(|(point, (block, &active))| {
                if !active {
                    return Ok(None);
                }
                let damping = mode.damping_diagonal(&block.diagonal()) * lambda;
                let damped = block + Matrix3::from_diagonal(&damping);

                let eigenvalues = damped.symmetric_eigenvalues();
                let min_ev = eigenvalues.min();
                let max_ev = eigenvalues.max();
                let singular = LinAlgError::SingularPointBlock {
                    point,
                    min_eigenvalue: min_ev,
                };
                if !(min_ev > MIN_EIGENVALUE_THRESHOLD * max_ev) {
                    return Err(singular);
                }
                if max_ev / min_ev > CONDITION_THRESHOLD {
                    debug!(
                        "Point block {} ill-conditioned (cond={:.2e})",
                        point,
                        max_ev / min_ev
                    );
                }
                damped.try_inverse().map(Some).ok_or(singular)
            })
            .collect();

        inverses
            .into_iter()
            .collect::<LinAlgResult<Vec<_>>>()
            .map_err(LinAlgError::log)
    }

    /// Block rows of `S` and `b_c'`, one rayon task per camera.
    fn reduced_rows(
        &self,
        graph: &ObservationGraph,
        equations: &NormalEquations,
        weighted: &[Option<CouplingMatrix>],
        lambda: f64,
    ) -> Vec<ReducedRow> {
        let edges = graph.edges();
        let mode = self.damping_mode;

        (0..equations.camera_blocks.len())
            .into_par_iter()
            .map(|camera| {
                let pairs = graph.camera_pairs(camera);
                let diagonal = &equations.camera_blocks[camera];
                let damping = mode.damping_diagonal(&diagonal.diagonal()) * lambda;

                let mut blocks: Vec<CameraMatrix> = pairs
                    .iter()
                    .map(|&other| {
                        if other == camera {
                            diagonal + CameraMatrix::from_diagonal(&damping)
                        } else {
                            CameraMatrix::zeros()
                        }
                    })
                    .collect();
                let mut rhs = equations.camera_gradients[camera];

                for &edge in graph.camera_edges(camera) {
                    let Some(w) = &weighted[edge] else {
                        continue;
                    };
                    let point = edges[edge].point;
                    rhs -= w * equations.point_gradients[point];

                    for other_edge in graph.point_edges(point) {
                        let other = edges[other_edge].camera;
                        if other < camera {
                            continue;
                        }
                        if let Ok(slot) = pairs.binary_search(&other) {
                            blocks[slot] -= w * equations.couplings[other_edge].transpose();
                        }
                    }
                }
                (blocks, rhs)
            })
            .collect()
    }

    fn solve_reduced(
        &mut self,
        graph: &ObservationGraph,
        rows: &[ReducedRow],
    ) -> LinAlgResult<Vec<CameraTangent>> {
        let dim = rows.len() * CAMERA_DOF;
        let (reduced, stored) = assemble_lower(graph, rows)?;

        let key = (dim, stored);
        if self.symbolic_key != Some(key) {
            let symbolic = SymbolicLlt::try_new(reduced.symbolic(), Side::Lower).map_err(|e| {
                LinAlgError::FactorizationFailed("Symbolic Cholesky failed".to_string())
                    .log_with_source(e)
            })?;
            debug!(
                "Computed symbolic factorization of reduced camera matrix ({}×{}, {} stored entries)",
                dim, dim, key.1
            );
            self.symbolic = Some(symbolic);
            self.symbolic_key = Some(key);
        }
        let Some(symbolic) = &self.symbolic else {
            return Err(LinAlgError::FactorizationFailed(
                "Missing symbolic factorization".to_string(),
            ));
        };

        // Not logged: the optimizer retries with larger damping
        let cholesky = Llt::try_new_with_symbolic(symbolic.clone(), reduced.as_ref(), Side::Lower)
            .map_err(|e| {
                LinAlgError::FactorizationFailed(format!(
                    "Reduced camera matrix not positive definite: {:?}",
                    e
                ))
            })?;

        let rhs = Mat::from_fn(dim, 1, |row, _| -rows[row / CAMERA_DOF].1[row % CAMERA_DOF]);
        let solution = cholesky.solve(&rhs);

        let cameras: Vec<CameraTangent> = (0..rows.len())
            .map(|camera| {
                CameraTangent::from_fn(|k, _| solution[(camera * CAMERA_DOF + k, 0)])
            })
            .collect();
        if !cameras.iter().all(|c| c.iter().all(|v| v.is_finite())) {
            return Err(LinAlgError::FactorizationFailed(
                "Non-finite camera step".to_string(),
            ));
        }
        Ok(cameras)
    }
}

/// `W_e = E_e·C_j⁻¹` for every edge, `None` when the point is inactive.
fn weighted_couplings(
    graph: &ObservationGraph,
    equations: &NormalEquations,
    inverses: &[PointInverse],
) -> Vec<Option<CouplingMatrix>> {
    graph
        .edges()
        .par_iter()
        .zip(equations.couplings.par_iter())
        .map(|(edge, coupling)| inverses[edge.point].map(|inverse| coupling * inverse))
        .collect()
}

/// Lower triangle of the symmetric reduced matrix in faer's sparse format,
/// with the number of emitted entries.
fn assemble_lower(
    graph: &ObservationGraph,
    rows: &[ReducedRow],
) -> LinAlgResult<(SparseColMat<usize, f64>, usize)> {
    let dim = rows.len() * CAMERA_DOF;
    let capacity: usize = rows.iter().map(|(blocks, _)| blocks.len()).sum::<usize>()
        * CAMERA_DOF
        * CAMERA_DOF;
    let mut triplets = Vec::with_capacity(capacity);

    for (camera, (blocks, _)) in rows.iter().enumerate() {
        let row_offset = camera * CAMERA_DOF;
        for (&other, block) in graph.camera_pairs(camera).iter().zip(blocks) {
            if other == camera {
                for c in 0..CAMERA_DOF {
                    for r in c..CAMERA_DOF {
                        triplets.push(Triplet::new(row_offset + r, row_offset + c, block[(r, c)]));
                    }
                }
            } else {
                // S_ki = S_ikᵀ lies below the diagonal
                let other_offset = other * CAMERA_DOF;
                for c in 0..CAMERA_DOF {
                    for r in 0..CAMERA_DOF {
                        triplets.push(Triplet::new(other_offset + c, row_offset + r, block[(r, c)]));
                    }
                }
            }
        }
    }

    let matrix = SparseColMat::try_new_from_triplets(dim, dim, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Reduced camera matrix".to_string()).log_with_source(e)
    })?;
    Ok((matrix, triplets.len()))
}

fn back_substitute(
    graph: &ObservationGraph,
    equations: &NormalEquations,
    inverses: &[PointInverse],
    cameras: &[CameraTangent],
) -> Vec<Vector3<f64>> {
    let edges = graph.edges();

    inverses
        .par_iter()
        .enumerate()
        .map(|(point, inverse)| {
            let Some(inverse) = inverse else {
                return Vector3::zeros();
            };
            let mut rhs = equations.point_gradients[point];
            for edge in graph.point_edges(point) {
                rhs += equations.couplings[edge].tr_mul(&cameras[edges[edge].camera]);
            }
            -(inverse * rhs)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::{CameraBlock, PointBlock};
    use crate::core::jacobian::JacobianMode;
    use crate::core::loss_functions::RobustLoss;
    use crate::core::problem::{BundleAdjustmentProblem, Observation};
    use crate::core::residual_block::ReprojectionResidual;
    use crate::manifold::RotationParameterization;
    use nalgebra::{DMatrix, DVector, Vector2};

    fn problem(extra_point: bool) -> BundleAdjustmentProblem {
        let cameras = [
            Vector3::new(0.0, 0.0, 6.0),
            Vector3::new(1.0, 0.2, 6.5),
            Vector3::new(-1.0, 0.5, 7.0),
        ]
        .into_iter()
        .map(|center| {
            CameraBlock::from_angle_axis_and_center(
                Vector3::new(0.02, -0.03, 0.01),
                center,
                400.0,
                0.02,
                -0.001,
                RotationParameterization::AngleAxis,
            )
            .unwrap()
        })
        .collect();
        let mut points = vec![
            PointBlock::new(Vector3::new(0.1, 0.2, 0.0)),
            PointBlock::new(Vector3::new(-0.4, 0.3, 0.5)),
            PointBlock::new(Vector3::new(0.6, -0.2, -0.3)),
        ];
        if extra_point {
            points.push(PointBlock::new(Vector3::new(5.0, 5.0, 5.0)));
        }
        let observations = vec![
            Observation::new(0, 0, Vector2::new(3.0, 9.0)),
            Observation::new(1, 0, Vector2::new(-40.0, 2.0)),
            Observation::new(0, 1, Vector2::new(-20.0, 14.0)),
            Observation::new(1, 1, Vector2::new(-70.0, 8.0)),
            Observation::new(2, 1, Vector2::new(30.0, -10.0)),
            Observation::new(2, 2, Vector2::new(100.0, -70.0)),
            Observation::new(0, 2, Vector2::new(42.0, -12.0)),
        ];
        BundleAdjustmentProblem::new(cameras, points, observations).unwrap()
    }

    fn equations(problem: &BundleAdjustmentProblem) -> NormalEquations {
        let residual =
            ReprojectionResidual::new(&RobustLoss::Huber { delta: 3.0 }, JacobianMode::Analytic)
                .unwrap();
        NormalEquations::build(problem, &problem.linearize(&residual))
    }

    fn dense_solve(
        problem: &BundleAdjustmentProblem,
        equations: &NormalEquations,
        lambda: f64,
        mode: DampingMode,
    ) -> DVector<f64> {
        let offset = 9 * problem.num_cameras();
        let n = offset + 3 * problem.num_points();
        let mut h = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);

        for (i, block) in equations.camera_blocks.iter().enumerate() {
            let d = mode.damping_diagonal(&block.diagonal()) * lambda;
            h.view_mut((9 * i, 9 * i), (9, 9))
                .copy_from(&(block + CameraMatrix::from_diagonal(&d)));
            g.rows_mut(9 * i, 9).copy_from(&equations.camera_gradients[i]);
        }
        for (j, block) in equations.point_blocks.iter().enumerate() {
            let d = mode.damping_diagonal(&block.diagonal()) * lambda;
            h.view_mut((offset + 3 * j, offset + 3 * j), (3, 3))
                .copy_from(&(block + Matrix3::from_diagonal(&d)));
            g.rows_mut(offset + 3 * j, 3).copy_from(&equations.point_gradients[j]);
        }
        for (edge, coupling) in problem.graph().edges().iter().zip(&equations.couplings) {
            h.view_mut((9 * edge.camera, offset + 3 * edge.point), (9, 3))
                .copy_from(coupling);
            h.view_mut((offset + 3 * edge.point, 9 * edge.camera), (3, 9))
                .copy_from(&coupling.transpose());
        }
        -h.cholesky().unwrap().solve(&g)
    }

    fn flatten(step: &SchurStep) -> DVector<f64> {
        let values: Vec<f64> = step
            .cameras
            .iter()
            .flat_map(|c| c.iter().copied())
            .chain(step.points.iter().flat_map(|p| p.iter().copied()))
            .collect();
        DVector::from_vec(values)
    }

    #[test]
    fn test_matches_dense_solve() {
        let problem = problem(false);
        let equations = equations(&problem);

        for mode in [DampingMode::Identity, DampingMode::Marquardt] {
            for lambda in [1e-2, 1.0] {
                let mut solver = SchurComplementSolver::new(mode);
                let step = solver.solve(problem.graph(), &equations, lambda).unwrap();
                let expected = dense_solve(&problem, &equations, lambda, mode);
                let error = (flatten(&step) - &expected).amax();
                assert!(
                    error < 1e-5 * expected.amax().max(1.0),
                    "mode {mode}, lambda {lambda}: error {error:e}"
                );
            }
        }
    }

    #[test]
    fn test_cached_symbolic_factorization() {
        let problem = problem(false);
        let equations = equations(&problem);

        let mut reused = SchurComplementSolver::new(DampingMode::Marquardt);
        reused.solve(problem.graph(), &equations, 10.0).unwrap();
        let second = reused.solve(problem.graph(), &equations, 1e-3).unwrap();

        let mut fresh = SchurComplementSolver::new(DampingMode::Marquardt);
        let expected = fresh.solve(problem.graph(), &equations, 1e-3).unwrap();
        assert!((flatten(&second) - flatten(&expected)).amax() < 1e-12);
    }

    #[test]
    fn test_unobserved_point_held_fixed() {
        let problem = problem(true);
        let equations = equations(&problem);
        assert!(!equations.active_points[3]);

        let mut solver = SchurComplementSolver::default();
        let step = solver.solve(problem.graph(), &equations, 1e-2).unwrap();
        assert_eq!(step.points[3], Vector3::zeros());
        assert!(step.is_finite());
        assert!(step.norm() > 0.0);
    }

    #[test]
    fn test_singular_point_block() {
        let problem = problem(false);
        let mut equations = equations(&problem);
        equations.point_blocks[1] = Matrix3::zeros();

        let mut solver = SchurComplementSolver::new(DampingMode::Identity);
        let result = solver.solve(problem.graph(), &equations, 0.0);
        assert!(matches!(
            result,
            Err(LinAlgError::SingularPointBlock { point: 1, .. })
        ));
    }

    #[test]
    fn test_marquardt_diagonal_clamped() {
        let diagonal = Vector3::new(0.0, 4.0, 1e40);
        let d = DampingMode::Marquardt.damping_diagonal(&diagonal);
        assert_eq!(d, Vector3::new(MIN_DIAGONAL, 4.0, MAX_DIAGONAL));
        assert_eq!(
            DampingMode::Identity.damping_diagonal(&diagonal),
            Vector3::repeat(1.0)
        );
    }
}
