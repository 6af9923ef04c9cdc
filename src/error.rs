//! Crate-level error taxonomy for calibration runs.
//!
//! Per-image failures ([`CalibrationError::DetectionFailure`],
//! [`CalibrationError::PoseSolveFailure`]) are reported individually and a
//! batch keeps going. Everything else aborts the operation that raised it.

use crate::camera::CameraModelError;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Pattern not found in image '{image}': {reason}")]
    DetectionFailure { image: String, reason: String },
    #[error("Insufficient data for {context}: need at least {required}, got {actual}")]
    InsufficientData {
        context: String,
        required: usize,
        actual: usize,
    },
    #[error("Pose solve failed for image '{image}': {reason}")]
    PoseSolveFailure { image: String, reason: String },
    #[error("Malformed transform: {0}")]
    MalformedTransform(String),
    #[error("No transform has been resolved yet")]
    NotCalibrated,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
    #[error("IO Error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CalibrationError {
    /// `true` for failures that only invalidate a single image.
    pub fn is_per_image(&self) -> bool {
        matches!(
            self,
            CalibrationError::DetectionFailure { .. } | CalibrationError::PoseSolveFailure { .. }
        )
    }

    /// Image identity attached to a per-image failure.
    pub fn image(&self) -> Option<&str> {
        match self {
            CalibrationError::DetectionFailure { image, .. }
            | CalibrationError::PoseSolveFailure { image, .. } => Some(image),
            _ => None,
        }
    }

    pub(crate) fn detection(image: &str, reason: impl Into<String>) -> Self {
        CalibrationError::DetectionFailure {
            image: image.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn pose(image: &str, reason: impl Into<String>) -> Self {
        CalibrationError::PoseSolveFailure {
            image: image.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}
