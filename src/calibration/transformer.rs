//! Camera-frame to vehicle-frame point transfer.

use nalgebra::{Matrix3xX, Vector3};

use crate::error::CalibrationError;
use crate::geometry::RigidTransform;

/// Applies a resolved camera-to-vehicle transform to points.
///
/// Holds no transform until calibration has resolved one; every call then
/// fails with [`CalibrationError::NotCalibrated`] rather than falling back to
/// the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointTransformer {
    transform: Option<RigidTransform>,
}

impl PointTransformer {
    pub fn new(transform: RigidTransform) -> Self {
        PointTransformer {
            transform: Some(transform),
        }
    }

    /// A transformer with nothing resolved yet.
    pub fn unresolved() -> Self {
        PointTransformer { transform: None }
    }

    pub fn transform(&self) -> Option<&RigidTransform> {
        self.transform.as_ref()
    }

    fn resolved(&self) -> Result<&RigidTransform, CalibrationError> {
        self.transform.as_ref().ok_or(CalibrationError::NotCalibrated)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Result<Vector3<f64>, CalibrationError> {
        Ok(self.resolved()?.transform_point(point))
    }

    pub fn transform_points(
        &self,
        points: &[Vector3<f64>],
    ) -> Result<Vec<Vector3<f64>>, CalibrationError> {
        let transform = self.resolved()?;
        Ok(points.iter().map(|p| transform.transform_point(p)).collect())
    }

    /// Batch form over a `3xN` matrix, one point per column.
    pub fn transform_matrix(&self, points: &Matrix3xX<f64>) -> Result<Matrix3xX<f64>, CalibrationError> {
        Ok(self.resolved()?.transform_points(points))
    }
}
