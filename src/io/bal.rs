//! Bundle Adjustment in the Large (BAL) datasets.
//!
//! ## Format
//!
//! 1. Header: `<num_cameras> <num_points> <num_observations>`
//! 2. One observation per line: `<camera_idx> <point_idx> <x> <y>`
//! 3. Nine values per camera, one per line: angle-axis rotation, translation,
//!    focal length, `k1`, `k2`
//! 4. Three values per point, one per line
//!
//! See <https://grail.cs.washington.edu/projects/bal/>.
//!
//! ## Example
//!
//! ```no_run
//! use apex_ba::io::{BalLoader, BalWriter};
//! use rand::SeedableRng;
//!
//! let mut dataset = BalLoader::load("problem-49-7776-pre.txt")?;
//! dataset.normalize()?;
//! dataset.perturb(0.01, 0.1, 0.1, &mut rand::rngs::StdRng::seed_from_u64(7))?;
//! BalWriter::write("perturbed.txt", &dataset)?;
//! # Ok::<(), apex_ba::io::IoError>(())
//! ```

use super::IoError;
use crate::core::camera::{CameraBlock, PointBlock};
use crate::core::problem::{BundleAdjustmentProblem, Observation};
use crate::core::{ProblemError, ProblemResult};
use crate::manifold::{ManifoldResult, Orientation, RotationParameterization, SO3};
use nalgebra::{Vector2, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Median absolute deviation of the points after [`BalDataset::normalize`].
const NORMALIZED_MEDIAN_DEVIATION: f64 = 100.0;

/// Snavely camera: `p_c = R(rotation)·p + translation`.
#[derive(Debug, Clone, PartialEq)]
pub struct BalCamera {
    /// Angle-axis rotation
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
    pub focal_length: f64,
    pub k1: f64,
    pub k2: f64,
}

impl BalCamera {
    /// `c = −Rᵀ·t`
    pub fn center(&self) -> Vector3<f64> {
        -(SO3::exp(&self.rotation).rotation_matrix().transpose() * self.translation)
    }

    /// Same intrinsics with a new rotation and center, `t = −R·c`.
    pub fn with_angle_axis_and_center(&self, rotation: Vector3<f64>, center: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation: -SO3::exp(&rotation).act(&center),
            ..self.clone()
        }
    }

    pub fn to_camera_block(
        &self,
        parameterization: RotationParameterization,
    ) -> ManifoldResult<CameraBlock> {
        Ok(CameraBlock::new(
            Orientation::from_angle_axis(self.rotation, parameterization)?,
            self.translation,
            self.focal_length,
            self.k1,
            self.k2,
        ))
    }

    pub fn from_camera_block(camera: &CameraBlock) -> Self {
        Self {
            rotation: camera.orientation.to_angle_axis(),
            translation: camera.translation,
            focal_length: camera.focal_length,
            k1: camera.k1,
            k2: camera.k2,
        }
    }

    fn values(&self) -> [f64; 9] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.focal_length,
            self.k1,
            self.k2,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalPoint {
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalObservation {
    pub camera_index: usize,
    pub point_index: usize,
    /// Pixel x-coordinate
    pub x: f64,
    /// Pixel y-coordinate
    pub y: f64,
}

/// Cameras, points and observations of a BAL file.
#[derive(Debug, Clone, PartialEq)]
pub struct BalDataset {
    pub cameras: Vec<BalCamera>,
    pub points: Vec<BalPoint>,
    pub observations: Vec<BalObservation>,
}

impl BalDataset {
    /// Center the points on their per-axis median and scale the scene so the
    /// median L1 deviation of the points is 100. Cameras move with the scene
    /// through their centers.
    pub fn normalize(&mut self) -> Result<(), IoError> {
        if self.points.is_empty() {
            return Err(IoError::InvalidDataset("cannot normalize without points".to_string()).log());
        }

        let center = Vector3::from_fn(|axis, _| {
            median(self.points.iter().map(|p| p.position[axis]).collect())
        });
        let deviation = median(
            self.points
                .iter()
                .map(|p| (p.position - center).abs().sum())
                .collect(),
        );
        if !(deviation > 0.0) || !deviation.is_finite() {
            return Err(IoError::InvalidDataset(format!(
                "median absolute deviation is {deviation}"
            ))
            .log());
        }
        let scale = NORMALIZED_MEDIAN_DEVIATION / deviation;

        for point in &mut self.points {
            point.position = scale * (point.position - center);
        }
        for camera in &mut self.cameras {
            let camera_center = scale * (camera.center() - center);
            *camera = camera.with_angle_axis_and_center(camera.rotation, camera_center);
        }

        info!(
            "Normalized dataset: median [{:.3}, {:.3}, {:.3}], scale {:.6e}",
            center.x, center.y, center.z, scale
        );
        Ok(())
    }

    /// Add zero-mean Gaussian noise to points, camera rotations (keeping the
    /// camera centers) and camera translations. A zero sigma leaves that part
    /// untouched.
    pub fn perturb<R: Rng + ?Sized>(
        &mut self,
        rotation_sigma: f64,
        translation_sigma: f64,
        point_sigma: f64,
        rng: &mut R,
    ) -> Result<(), IoError> {
        let point_noise = noise(point_sigma)?;
        let rotation_noise = noise(rotation_sigma)?;
        let translation_noise = noise(translation_sigma)?;

        if let Some(normal) = &point_noise {
            for point in &mut self.points {
                point.position += sample(normal, rng);
            }
        }
        for camera in &mut self.cameras {
            if let Some(normal) = &rotation_noise {
                let center = camera.center();
                let rotation = camera.rotation + sample(normal, rng);
                *camera = camera.with_angle_axis_and_center(rotation, center);
            }
            if let Some(normal) = &translation_noise {
                camera.translation += sample(normal, rng);
            }
        }
        Ok(())
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    let mid = values.len() / 2;
    let (_, value, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    *value
}

fn noise(sigma: f64) -> Result<Option<Normal<f64>>, IoError> {
    if sigma == 0.0 {
        return Ok(None);
    }
    if !(sigma > 0.0) {
        return Err(IoError::InvalidArgument(format!("noise sigma must be >= 0, got {sigma}")).log());
    }
    Normal::new(0.0, sigma)
        .map(Some)
        .map_err(|e| IoError::InvalidArgument(format!("noise sigma {sigma}: {e}")).log())
}

fn sample<R: Rng + ?Sized>(normal: &Normal<f64>, rng: &mut R) -> Vector3<f64> {
    Vector3::new(normal.sample(rng), normal.sample(rng), normal.sample(rng))
}

/// Loader for BAL text files.
pub struct BalLoader;

impl BalLoader {
    pub fn load(path: impl AsRef<Path>) -> Result<BalDataset, IoError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| IoError::Io(e).log_with_source(format!("Failed to open BAL file {path:?}")))?;

        let mmap = unsafe {
            memmap2::Mmap::map(&file).map_err(|e| {
                IoError::Io(e).log_with_source(format!("Failed to memory-map BAL file {path:?}"))
            })?
        };
        let content = std::str::from_utf8(&mmap).map_err(|e| {
            IoError::Parse {
                line: 0,
                message: format!("Invalid UTF-8: {e}"),
            }
            .log()
        })?;

        let dataset = Self::parse(content).map_err(IoError::log)?;
        info!(
            "Loaded BAL dataset {:?}: {} cameras, {} points, {} observations",
            path,
            dataset.cameras.len(),
            dataset.points.len(),
            dataset.observations.len()
        );
        Ok(dataset)
    }

    /// Parse BAL text that is already in memory.
    pub fn parse(content: &str) -> Result<BalDataset, IoError> {
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let (num_cameras, num_points, num_observations) = Self::parse_header(&mut lines)?;
        let observations = Self::parse_observations(&mut lines, num_observations)?;

        let cameras = (0..num_cameras)
            .map(|camera| {
                let v = Self::parse_values::<9>(&mut lines, "camera", camera)?;
                Ok(BalCamera {
                    rotation: Vector3::new(v[0], v[1], v[2]),
                    translation: Vector3::new(v[3], v[4], v[5]),
                    focal_length: v[6],
                    k1: v[7],
                    k2: v[8],
                })
            })
            .collect::<Result<Vec<_>, IoError>>()?;

        let points = (0..num_points)
            .map(|point| {
                let v = Self::parse_values::<3>(&mut lines, "point", point)?;
                Ok(BalPoint {
                    position: Vector3::new(v[0], v[1], v[2]),
                })
            })
            .collect::<Result<Vec<_>, IoError>>()?;

        if let Some((line, _)) = lines.next() {
            return Err(IoError::Parse {
                line,
                message: "Trailing content after the last point".to_string(),
            });
        }

        Ok(BalDataset {
            cameras,
            points,
            observations,
        })
    }

    fn parse_header<'a>(
        lines: &mut impl Iterator<Item = (usize, &'a str)>,
    ) -> Result<(usize, usize, usize), IoError> {
        let (line, header) = lines.next().ok_or(IoError::Parse {
            line: 1,
            message: "Missing header line".to_string(),
        })?;

        let parts: Vec<&str> = header.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(IoError::MissingFields { line });
        }
        Ok((
            parse_field(parts[0], line)?,
            parse_field(parts[1], line)?,
            parse_field(parts[2], line)?,
        ))
    }

    fn parse_observations<'a>(
        lines: &mut impl Iterator<Item = (usize, &'a str)>,
        num_observations: usize,
    ) -> Result<Vec<BalObservation>, IoError> {
        let mut observations = Vec::with_capacity(num_observations);

        for observation in 0..num_observations {
            let (line, text) = lines.next().ok_or_else(|| IoError::Parse {
                line: 0,
                message: format!("Unexpected end of file at observation {observation}"),
            })?;

            let parts: Vec<&str> = text.split_whitespace().collect();
            if parts.len() != 4 {
                return Err(IoError::MissingFields { line });
            }
            observations.push(BalObservation {
                camera_index: parse_field(parts[0], line)?,
                point_index: parse_field(parts[1], line)?,
                x: parse_field(parts[2], line)?,
                y: parse_field(parts[3], line)?,
            });
        }

        Ok(observations)
    }

    /// `N` consecutive single-value lines of one camera or point.
    fn parse_values<'a, const N: usize>(
        lines: &mut impl Iterator<Item = (usize, &'a str)>,
        block: &str,
        index: usize,
    ) -> Result<[f64; N], IoError> {
        let mut values = [0.0; N];
        for (k, value) in values.iter_mut().enumerate() {
            let (line, text) = lines.next().ok_or_else(|| IoError::Parse {
                line: 0,
                message: format!("Unexpected end of file in {block} {index} value {k}"),
            })?;
            *value = parse_field(text, line)?;
        }
        Ok(values)
    }
}

fn parse_field<T: FromStr>(token: &str, line: usize) -> Result<T, IoError> {
    token.parse::<T>().map_err(|_| IoError::InvalidNumber {
        line,
        value: token.to_string(),
    })
}

/// Writer for BAL text files. Values are written in their shortest exact
/// decimal form, so a written dataset reloads bit for bit.
pub struct BalWriter;

impl BalWriter {
    pub fn write(path: impl AsRef<Path>, dataset: &BalDataset) -> Result<(), IoError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| IoError::Io(e).log_with_source(format!("Failed to create {path:?}")))?;
        let mut writer = BufWriter::new(file);
        Self::write_to(&mut writer, dataset)
            .and_then(|()| writer.flush().map_err(IoError::from))
            .map_err(|e| e.log_with_source(format!("Failed to write BAL file {path:?}")))?;

        info!("Wrote BAL dataset {:?}", path);
        Ok(())
    }

    pub fn write_to<W: Write>(writer: &mut W, dataset: &BalDataset) -> Result<(), IoError> {
        writeln!(
            writer,
            "{} {} {}",
            dataset.cameras.len(),
            dataset.points.len(),
            dataset.observations.len()
        )?;
        for obs in &dataset.observations {
            writeln!(
                writer,
                "{} {} {} {}",
                obs.camera_index, obs.point_index, obs.x, obs.y
            )?;
        }
        for camera in &dataset.cameras {
            for value in camera.values() {
                writeln!(writer, "{value}")?;
            }
        }
        for point in &dataset.points {
            for value in point.position.iter() {
                writeln!(writer, "{value}")?;
            }
        }
        Ok(())
    }
}

impl BundleAdjustmentProblem {
    /// Build a problem from a loaded dataset, storing rotations in the given
    /// representation.
    pub fn from_dataset(
        dataset: &BalDataset,
        parameterization: RotationParameterization,
    ) -> ProblemResult<Self> {
        let cameras = dataset
            .cameras
            .iter()
            .enumerate()
            .map(|(camera, c)| {
                c.to_camera_block(parameterization)
                    .map_err(|source| ProblemError::InvalidCamera { camera, source }.log())
            })
            .collect::<ProblemResult<Vec<_>>>()?;
        let points = dataset
            .points
            .iter()
            .map(|p| PointBlock::new(p.position))
            .collect();
        let observations = dataset
            .observations
            .iter()
            .map(|o| Observation::new(o.camera_index, o.point_index, Vector2::new(o.x, o.y)))
            .collect();

        Self::new(cameras, points, observations)
    }

    /// Copy the current cameras (as angle-axis) and points into `dataset`.
    pub fn write_back(&self, dataset: &mut BalDataset) -> ProblemResult<()> {
        let expected = 9 * dataset.cameras.len() + 3 * dataset.points.len();
        let actual = 9 * self.num_cameras() + 3 * self.num_points();
        if dataset.cameras.len() != self.num_cameras() || dataset.points.len() != self.num_points()
        {
            return Err(ProblemError::ParameterCountMismatch { expected, actual }.log());
        }

        for (target, camera) in dataset.cameras.iter_mut().zip(self.cameras()) {
            *target = BalCamera::from_camera_block(camera);
        }
        for (target, point) in dataset.points.iter_mut().zip(self.points()) {
            target.position = point.position;
        }
        Ok(())
    }
}
