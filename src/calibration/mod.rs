//! The calibration engine: correspondence accumulation, intrinsic solve,
//! perspective-n-point, camera-to-vehicle extrinsics and point transfer.
//!
//! Frames:
//! * pattern: origin at the first inner corner, X along the corner rows, Y
//!   along the columns, Z out of the board
//! * camera: optical centre, X right, Y down, Z along the optical axis
//! * vehicle: rear-axle centre, X forward, Y left, Z up

use nalgebra::{Matrix2xX, Matrix3xX, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod coverage;
pub mod extrinsic;
pub mod intrinsic;
pub mod pnp;
pub mod synthetic;
pub mod transformer;

pub use coverage::{CellCoverage, CellStatus, CoverageAnalyzer, CoverageReport};
pub use extrinsic::{ExtrinsicEngine, PatternBatchReport, PatternPlacement};
pub use intrinsic::{IntrinsicAccumulator, MIN_CALIBRATION_IMAGES};
pub use pnp::{PoseSolution, PoseSolver, MIN_POSE_POINTS};
pub use transformer::PointTransformer;

use crate::camera::{CameraIntrinsics, LensModel};
use crate::error::CalibrationError;
use crate::geometry::{EulerAngles, RigidTransform, VEHICLE_EULER_ORDER};
use crate::optimization::{PlanarView, SolverOptions};

/// Inner-corner grid of the planar target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternGeometry {
    /// Inner corners per row.
    pub cols: usize,
    /// Inner corners per column.
    pub rows: usize,
    /// Edge length of one square in metres.
    pub square_size: f64,
}

impl Default for PatternGeometry {
    fn default() -> Self {
        PatternGeometry {
            cols: 9,
            rows: 6,
            square_size: 0.025,
        }
    }
}

impl PatternGeometry {
    pub fn point_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Corner positions in the pattern frame, row-major: index `r * cols + c`
    /// lies at `(c * square_size, r * square_size, 0)`.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.cols).map(move |c| {
                    Vector3::new(
                        c as f64 * self.square_size,
                        r as f64 * self.square_size,
                        0.0,
                    )
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.cols < 2 || self.rows < 2 {
            return Err(CalibrationError::InvalidInput(format!(
                "pattern needs at least 2x2 inner corners, got {}x{}",
                self.cols, self.rows
            )));
        }
        if !(self.square_size > 0.0 && self.square_size.is_finite()) {
            return Err(CalibrationError::InvalidInput(format!(
                "square size must be positive, got {}",
                self.square_size
            )));
        }
        Ok(())
    }
}

/// Configuration of an intrinsic calibration session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicConfig {
    pub pattern: PatternGeometry,
    pub lens: LensModel,
    pub solver: SolverOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseSolverConfig {
    pub solver: SolverOptions,
    /// Solutions with a larger reprojection RMS are rejected.
    pub max_rms_px: f64,
}

impl Default for PoseSolverConfig {
    fn default() -> Self {
        PoseSolverConfig {
            solver: SolverOptions::default(),
            max_rms_px: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrinsicConfig {
    pub pose: PoseSolverConfig,
}

/// Ordered 3D-2D corner pairs observed in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceSet {
    image_id: String,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
}

impl CorrespondenceSet {
    /// # Errors
    ///
    /// [`CalibrationError::InvalidInput`] if the two sequences differ in
    /// length or contain non-finite values.
    pub fn new(
        image_id: impl Into<String>,
        object_points: Vec<Vector3<f64>>,
        image_points: Vec<Vector2<f64>>,
    ) -> Result<Self, CalibrationError> {
        let image_id = image_id.into();
        if object_points.len() != image_points.len() {
            return Err(CalibrationError::InvalidInput(format!(
                "image '{}': {} pattern points but {} image points",
                image_id,
                object_points.len(),
                image_points.len()
            )));
        }
        let finite = object_points.iter().all(|p| p.iter().all(|v| v.is_finite()))
            && image_points.iter().all(|p| p.iter().all(|v| v.is_finite()));
        if !finite {
            return Err(CalibrationError::InvalidInput(format!(
                "image '{}': correspondences contain non-finite values",
                image_id
            )));
        }
        Ok(CorrespondenceSet {
            image_id,
            object_points,
            image_points,
        })
    }

    /// Pairs detected corners with the pattern grid, in detection order.
    pub fn from_grid(
        image_id: impl Into<String>,
        pattern: &PatternGeometry,
        corners: Vec<Vector2<f64>>,
    ) -> Result<Self, CalibrationError> {
        Self::new(image_id, pattern.object_points(), corners)
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn object_points(&self) -> &[Vector3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Vector2<f64>] {
        &self.image_points
    }

    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }

    pub(crate) fn to_view(&self) -> PlanarView {
        PlanarView {
            points3d: Matrix3xX::from_columns(&self.object_points),
            points2d: Matrix2xX::from_columns(&self.image_points),
        }
    }
}

/// Solved camera and the residual of the solve that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicResult {
    pub camera: CameraIntrinsics,
    /// Root-mean-square pixel reprojection residual over all points.
    pub rms_error: f64,
    /// Accepted images, in solve order.
    pub image_ids: Vec<String>,
    /// Pattern-to-camera pose of each accepted image. Kept for reprojection
    /// checks only, never persisted.
    pub view_poses: Vec<RigidTransform>,
}

/// Resolved camera-to-vehicle transform and its roll/pitch/yaw view in
/// [`VEHICLE_EULER_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrinsicResult {
    pub camera_to_vehicle: RigidTransform,
    pub euler: EulerAngles,
}

impl ExtrinsicResult {
    pub fn new(camera_to_vehicle: RigidTransform) -> Self {
        ExtrinsicResult {
            euler: camera_to_vehicle.euler_angles(VEHICLE_EULER_ORDER),
            camera_to_vehicle,
        }
    }
}

/// Outcome of one calibration run.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationResult {
    Intrinsic(IntrinsicResult),
    Extrinsic(ExtrinsicResult),
}

impl From<IntrinsicResult> for CalibrationResult {
    fn from(result: IntrinsicResult) -> Self {
        CalibrationResult::Intrinsic(result)
    }
}

impl From<ExtrinsicResult> for CalibrationResult {
    fn from(result: ExtrinsicResult) -> Self {
        CalibrationResult::Extrinsic(result)
    }
}
