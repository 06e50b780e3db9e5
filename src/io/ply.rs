//! ASCII PLY export for inspecting a reconstruction in MeshLab or CloudCompare.
//!
//! Camera centers are written as green vertices, points as white ones.

use super::IoError;
use super::bal::BalDataset;
use nalgebra::Vector3;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

const CAMERA_COLOR: [u8; 3] = [0, 255, 0];
const POINT_COLOR: [u8; 3] = [255, 255, 255];

pub struct PlyWriter;

impl PlyWriter {
    pub fn write(path: impl AsRef<Path>, dataset: &BalDataset) -> Result<(), IoError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| IoError::Io(e).log_with_source(format!("Failed to create {path:?}")))?;
        let mut writer = BufWriter::new(file);
        Self::write_to(&mut writer, dataset)
            .and_then(|()| writer.flush().map_err(IoError::from))
            .map_err(|e| e.log_with_source(format!("Failed to write PLY file {path:?}")))?;

        info!(
            "Wrote PLY file {:?}: {} camera centers, {} points",
            path,
            dataset.cameras.len(),
            dataset.points.len()
        );
        Ok(())
    }

    pub fn write_to<W: Write>(writer: &mut W, dataset: &BalDataset) -> Result<(), IoError> {
        writeln!(writer, "ply")?;
        writeln!(writer, "format ascii 1.0")?;
        writeln!(
            writer,
            "element vertex {}",
            dataset.cameras.len() + dataset.points.len()
        )?;
        for axis in ["x", "y", "z"] {
            writeln!(writer, "property float {axis}")?;
        }
        for channel in ["red", "green", "blue"] {
            writeln!(writer, "property uchar {channel}")?;
        }
        writeln!(writer, "end_header")?;

        for camera in &dataset.cameras {
            write_vertex(writer, &camera.center(), CAMERA_COLOR)?;
        }
        for point in &dataset.points {
            write_vertex(writer, &point.position, POINT_COLOR)?;
        }
        Ok(())
    }
}

fn write_vertex<W: Write>(
    writer: &mut W,
    position: &Vector3<f64>,
    [r, g, b]: [u8; 3],
) -> Result<(), IoError> {
    writeln!(
        writer,
        "{} {} {} {} {} {}",
        position.x, position.y, position.z, r, g, b
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bal::{BalCamera, BalPoint};

    #[test]
    fn test_header_and_vertices() -> Result<(), IoError> {
        let dataset = BalDataset {
            cameras: vec![BalCamera {
                rotation: Vector3::zeros(),
                translation: Vector3::new(1.0, -3.0, -2.0),
                focal_length: 500.0,
                k1: 0.0,
                k2: 0.0,
            }],
            points: vec![BalPoint {
                position: Vector3::new(1.0, -1.5, 0.25),
            }],
            observations: Vec::new(),
        };

        let mut buffer = Vec::new();
        PlyWriter::write_to(&mut buffer, &dataset)?;
        let text = String::from_utf8_lossy(&buffer);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "ply");
        assert_eq!(lines[2], "element vertex 2");
        assert_eq!(lines[9], "end_header");
        assert_eq!(lines[10], "-1 3 2 0 255 0");
        assert_eq!(lines[11], "1 -1.5 0.25 255 255 255");
        assert_eq!(lines.len(), 12);
        Ok(())
    }
}
