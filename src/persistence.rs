//! Key-value documents for solved intrinsics, extrinsics and configuration.
//!
//! Typed results are converted to plain documents only here. Files ending in
//! `.json` are written as JSON, everything else as YAML.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::calibration::{ExtrinsicResult, IntrinsicResult};
use crate::camera::{CameraIntrinsics, CameraModel, Intrinsics, LensModel, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{RigidTransform, ORTHONORMAL_TOLERANCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicDocument {
    pub camera_matrix: [[f64; 3]; 3],
    pub distortion_model: LensModel,
    pub distortion_coeffs: Vec<f64>,
    pub rms_error: f64,
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_reprojection_error: Option<f64>,
}

impl IntrinsicDocument {
    pub fn from_result(result: &IntrinsicResult, mean_reprojection_error: Option<f64>) -> Self {
        let resolution = result.camera.get_resolution();
        IntrinsicDocument {
            camera_matrix: matrix3_rows(&result.camera.camera_matrix()),
            distortion_model: result.camera.lens(),
            distortion_coeffs: result.camera.get_distortion(),
            rms_error: result.rms_error,
            image_width: resolution.width,
            image_height: resolution.height,
            mean_reprojection_error,
        }
    }

    /// Rebuilds the camera. The matrix must have zero skew and a
    /// `[0, 0, 1]` last row.
    pub fn to_camera(&self) -> Result<CameraIntrinsics, CalibrationError> {
        let k = &self.camera_matrix;
        let structural = [k[0][1], k[1][0], k[2][0], k[2][1], k[2][2] - 1.0];
        if structural.iter().any(|v| v.abs() > 1e-9) {
            return Err(CalibrationError::InvalidInput(format!(
                "camera matrix is not of the form [[fx, 0, cx], [0, fy, cy], [0, 0, 1]]: {:?}",
                k
            )));
        }
        Ok(CameraIntrinsics::new(
            self.distortion_model,
            Intrinsics {
                fx: k[0][0],
                fy: k[1][1],
                cx: k[0][2],
                cy: k[1][2],
            },
            Resolution {
                width: self.image_width,
                height: self.image_height,
            },
            &self.distortion_coeffs,
        )?)
    }
}

impl From<&IntrinsicResult> for IntrinsicDocument {
    fn from(result: &IntrinsicResult) -> Self {
        IntrinsicDocument::from_result(result, None)
    }
}

/// Roll, pitch and yaw in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EulerDegrees {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicDocument {
    pub rotation_matrix: [[f64; 3]; 3],
    pub translation_vector: [f64; 3],
    pub transformation_matrix: [[f64; 4]; 4],
    /// Informational; the rotation matrix is authoritative.
    pub euler_angles: EulerDegrees,
}

impl ExtrinsicDocument {
    /// Validates and rebuilds the camera-to-vehicle transform.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::MalformedTransform`] if the rotation is not
    /// orthonormal, or if `transformation_matrix` disagrees with
    /// `rotation_matrix` and `translation_vector`.
    pub fn to_transform(&self) -> Result<RigidTransform, CalibrationError> {
        let r = &self.rotation_matrix;
        let rotation = Matrix3::new(
            r[0][0], r[0][1], r[0][2], //
            r[1][0], r[1][1], r[1][2], //
            r[2][0], r[2][1], r[2][2],
        );
        let transform = RigidTransform::new(rotation, Vector3::from(self.translation_vector))?;

        let stored = Matrix4::from_fn(|i, j| self.transformation_matrix[i][j]);
        let deviation = (stored - transform.matrix()).amax();
        if !(deviation <= ORTHONORMAL_TOLERANCE) {
            return Err(CalibrationError::MalformedTransform(format!(
                "transformation_matrix differs from rotation/translation by {:.3e}",
                deviation
            )));
        }
        Ok(transform)
    }
}

impl From<&ExtrinsicResult> for ExtrinsicDocument {
    fn from(result: &ExtrinsicResult) -> Self {
        let transform = &result.camera_to_vehicle;
        let t = transform.translation();
        let m = transform.matrix();
        let [roll, pitch, yaw] = result.euler.to_degrees();
        ExtrinsicDocument {
            rotation_matrix: matrix3_rows(transform.rotation()),
            translation_vector: [t.x, t.y, t.z],
            transformation_matrix: std::array::from_fn(|i| std::array::from_fn(|j| m[(i, j)])),
            euler_angles: EulerDegrees { roll, pitch, yaw },
        }
    }
}

fn matrix3_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    std::array::from_fn(|i| std::array::from_fn(|j| m[(i, j)]))
}

/// Writes `document` to `path`, JSON for `.json` files and YAML otherwise.
pub fn save_document<T: Serialize>(document: &T, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
    let path = path.as_ref();
    let contents = match DocumentFormat::from_path(path) {
        DocumentFormat::Json => serde_json::to_string_pretty(document)?,
        DocumentFormat::Yaml => serde_yaml::to_string(document)?,
    };
    let mut file = fs::File::create(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

pub fn load_document<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, CalibrationError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    Ok(match DocumentFormat::from_path(path) {
        DocumentFormat::Json => serde_json::from_str(&contents)?,
        DocumentFormat::Yaml => serde_yaml::from_str(&contents)?,
    })
}
