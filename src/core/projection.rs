//! BAL projection model.
//!
//! The camera looks down its negative Z axis (Bundler / OpenGL convention):
//!
//! ```text
//! p_c = R·p + t
//! x_n = -p_c.x / p_c.z,   y_n = -p_c.y / p_c.z
//! r²  = x_n² + y_n²
//! d   = 1 + k1·r² + k2·r⁴
//! u   = f·d·x_n,          v = f·d·y_n
//! ```
//!
//! There is no principal point: pixel coordinates are relative to the image
//! center. The depth of a point is `-p_c.z`; points with depth at or below
//! [`MIN_DEPTH`] cannot be projected and yield
//! [`ProjectionError::DegenerateProjection`] instead of NaN.

use super::ProjectionError;
use super::camera::{CAMERA_DOF, CameraBlock, POINT_DOF, PointBlock};
use crate::manifold::skew;
use nalgebra::{Matrix2, SMatrix, Vector2, Vector3};

/// Smallest depth (along -Z) accepted for a projection.
pub const MIN_DEPTH: f64 = 1e-6;

pub type CameraJacobian = SMatrix<f64, 2, CAMERA_DOF>;
pub type PointJacobian = SMatrix<f64, 2, POINT_DOF>;

/// Project a world point into the image of `camera`.
pub fn project(camera: &CameraBlock, point: &PointBlock) -> Result<Vector2<f64>, ProjectionError> {
    project_camera_frame(camera, &camera.transform_point(&point.position))
}

/// Project a point already expressed in the camera frame.
pub fn project_camera_frame(
    camera: &CameraBlock,
    p_cam: &Vector3<f64>,
) -> Result<Vector2<f64>, ProjectionError> {
    let depth = checked_depth(p_cam)?;
    let x_n = p_cam.x / depth;
    let y_n = p_cam.y / depth;

    let r2 = x_n * x_n + y_n * y_n;
    let r4 = r2 * r2;
    let distortion = 1.0 + camera.k1 * r2 + camera.k2 * r4;

    Ok(Vector2::new(
        camera.focal_length * distortion * x_n,
        camera.focal_length * distortion * y_n,
    ))
}

/// Depth along -Z, or an error when the point is not in front of the camera.
#[inline]
pub fn checked_depth(p_cam: &Vector3<f64>) -> Result<f64, ProjectionError> {
    let depth = -p_cam.z;
    // `!(depth > MIN_DEPTH)` also rejects NaN
    if !(depth > MIN_DEPTH) {
        return Err(ProjectionError::DegenerateProjection { depth });
    }
    Ok(depth)
}

/// Projection together with its analytic derivatives.
///
/// The camera Jacobian is taken with respect to the tangent vector
/// `[δω, δt, δf, δk1, δk2]` of the left update `R ← Exp(δω)·R`, which gives
///
/// ```text
/// ∂p_c/∂δω = -[R·p]ₓ      ∂p_c/∂δt = I      ∂p_c/∂p = R
/// ```
///
/// The image derivatives follow from the chain rule through
/// `(u, v) = f·d(r²)·(x_n, y_n)`:
///
/// ```text
/// ∂u/∂x_n = f·(d + 2·x_n²·d')      ∂u/∂y_n = f·2·x_n·y_n·d'
/// ∂v/∂x_n = f·2·x_n·y_n·d'         ∂v/∂y_n = f·(d + 2·y_n²·d')
/// ∂x_n/∂p_c = [1/depth, 0, x_n/depth]
/// ∂y_n/∂p_c = [0, 1/depth, y_n/depth]
/// ```
///
/// with `d' = k1 + 2·k2·r²`, and for the intrinsics
///
/// ```text
/// ∂(u,v)/∂f  = d·(x_n, y_n)
/// ∂(u,v)/∂k1 = f·r²·(x_n, y_n)
/// ∂(u,v)/∂k2 = f·r⁴·(x_n, y_n)
/// ```
pub fn project_with_jacobians(
    camera: &CameraBlock,
    point: &PointBlock,
) -> Result<(Vector2<f64>, CameraJacobian, PointJacobian), ProjectionError> {
    let rotated = camera.orientation.rotate(&point.position);
    let p_cam = rotated + camera.translation;

    let depth = checked_depth(&p_cam)?;
    let inv_depth = 1.0 / depth;
    let x_n = p_cam.x / depth;
    let y_n = p_cam.y / depth;

    let f = camera.focal_length;
    let r2 = x_n * x_n + y_n * y_n;
    let r4 = r2 * r2;
    let distortion = 1.0 + camera.k1 * r2 + camera.k2 * r4;
    let d_dist_dr2 = camera.k1 + 2.0 * camera.k2 * r2;

    let projected = Vector2::new(f * distortion * x_n, f * distortion * y_n);

    let d_uv_d_normalized = Matrix2::new(
        f * (distortion + 2.0 * x_n * x_n * d_dist_dr2),
        f * (2.0 * x_n * y_n * d_dist_dr2),
        f * (2.0 * x_n * y_n * d_dist_dr2),
        f * (distortion + 2.0 * y_n * y_n * d_dist_dr2),
    );
    let d_normalized_d_pcam = SMatrix::<f64, 2, 3>::new(
        inv_depth,
        0.0,
        x_n * inv_depth,
        0.0,
        inv_depth,
        y_n * inv_depth,
    );
    let d_uv_d_pcam = d_uv_d_normalized * d_normalized_d_pcam;

    let d_uv_d_rotation = d_uv_d_pcam * (-skew(&rotated));

    let mut camera_jacobian = CameraJacobian::zeros();
    camera_jacobian
        .fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&d_uv_d_rotation);
    camera_jacobian.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_uv_d_pcam);
    camera_jacobian[(0, 6)] = distortion * x_n;
    camera_jacobian[(1, 6)] = distortion * y_n;
    camera_jacobian[(0, 7)] = f * r2 * x_n;
    camera_jacobian[(1, 7)] = f * r2 * y_n;
    camera_jacobian[(0, 8)] = f * r4 * x_n;
    camera_jacobian[(1, 8)] = f * r4 * y_n;

    let point_jacobian = d_uv_d_pcam * camera.orientation.rotation_matrix();

    Ok((projected, camera_jacobian, point_jacobian))
}
