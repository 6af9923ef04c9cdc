//! Declared basis conventions between the pattern and vehicle frames.

use nalgebra::{Matrix3, Vector3};

use crate::error::CalibrationError;
use crate::geometry::transform::RigidTransform;

/// A signed permutation matrix expressing one frame's axes in another's.
///
/// Column `j` is the direction of source axis `j` written in the target frame.
/// Remaps are declared per mounting scenario and never estimated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRemap {
    matrix: Matrix3<f64>,
}

impl AxisRemap {
    /// Pattern frame (X right, Y down, Z out of the board towards the
    /// vehicle's forward direction when the board faces the camera) to
    /// vehicle frame (X forward, Y left, Z up):
    ///
    /// * pattern Z -> vehicle  X
    /// * pattern X -> vehicle -Y
    /// * pattern Y -> vehicle -Z
    pub const CHECKERBOARD_TO_VEHICLE: AxisRemap = AxisRemap {
        matrix: Matrix3::new(
            0.0, 0.0, 1.0, //
            -1.0, 0.0, 0.0, //
            0.0, -1.0, 0.0,
        ),
    };

    pub const IDENTITY: AxisRemap = AxisRemap {
        matrix: Matrix3::new(
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0,
        ),
    };

    /// Validates a custom remap: entries in `{-1, 0, 1}`, one non-zero per
    /// row and column, determinant `+1`.
    pub fn new(matrix: Matrix3<f64>) -> Result<Self, CalibrationError> {
        if matrix
            .iter()
            .any(|v| !(*v == 0.0 || *v == 1.0 || *v == -1.0))
        {
            return Err(CalibrationError::InvalidInput(format!(
                "axis remap entries must be -1, 0 or 1: {:?}",
                matrix.iter().collect::<Vec<_>>()
            )));
        }
        let rows_ok = matrix
            .row_iter()
            .all(|row| row.iter().filter(|v| **v != 0.0).count() == 1);
        let cols_ok = matrix
            .column_iter()
            .all(|col| col.iter().filter(|v| **v != 0.0).count() == 1);
        if !rows_ok || !cols_ok {
            return Err(CalibrationError::InvalidInput(
                "axis remap must have exactly one non-zero entry per row and column".to_string(),
            ));
        }
        if matrix.determinant() < 0.0 {
            return Err(CalibrationError::InvalidInput(
                "axis remap is a reflection (determinant -1)".to_string(),
            ));
        }
        Ok(AxisRemap { matrix })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Expresses a source-frame direction in the target frame.
    pub fn apply(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * v
    }

    /// The remap as a rotation-only transform.
    pub fn as_transform(&self) -> RigidTransform {
        RigidTransform::from_parts_unchecked(self.matrix, Vector3::zeros())
    }
}
