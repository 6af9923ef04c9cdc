//! Perspective-n-point for a planar pattern seen by a calibrated camera.

use log::{debug, warn};
use nalgebra::{Matrix2xX, Matrix3xX};

use crate::calibration::{CorrespondenceSet, PoseSolverConfig};
use crate::camera::{undistort_points, CameraIntrinsics, CameraModel, LensModel};
use crate::error::CalibrationError;
use crate::geometry::RigidTransform;
use crate::optimization::intrinsics::view_reprojection_errors;
use crate::optimization::{Optimizer, PoseOptimizationCost, ProjectionError};

/// Minimum correspondences for a unique pose under a calibrated camera.
pub const MIN_POSE_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSolution {
    /// Maps pattern-frame points into the camera frame. Invert before
    /// composing towards the vehicle frame.
    pub pattern_to_camera: RigidTransform,
    /// RMS pixel residual against the observed (distorted) corners.
    pub rms_error: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PoseSolver {
    config: PoseSolverConfig,
}

impl PoseSolver {
    pub fn new(config: PoseSolverConfig) -> Self {
        PoseSolver { config }
    }

    pub fn config(&self) -> &PoseSolverConfig {
        &self.config
    }

    /// Solves the pattern-to-camera pose of one image.
    ///
    /// Wide-angle observations are first undistorted into the pixels of a
    /// pinhole camera with the same `K`; standard-lens observations go into
    /// the minimisation with their distortion model.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientData`] with fewer than
    ///   [`MIN_POSE_POINTS`] correspondences.
    /// * [`CalibrationError::PoseSolveFailure`] naming the image when the
    ///   points are degenerate, the solver does not converge, the pattern ends
    ///   up behind the camera or the residual exceeds `max_rms_px`.
    pub fn solve(
        &self,
        set: &CorrespondenceSet,
        camera: &CameraIntrinsics,
    ) -> Result<PoseSolution, CalibrationError> {
        let image = set.image_id();
        if set.len() < MIN_POSE_POINTS {
            return Err(CalibrationError::InsufficientData {
                context: format!("pose correspondences in image '{}'", image),
                required: MIN_POSE_POINTS,
                actual: set.len(),
            });
        }

        let points3d = Matrix3xX::from_columns(set.object_points());
        let mut cost = if camera.lens().is_wide_angle() {
            let k = camera.get_intrinsics();
            let undistorted = undistort_points(camera, set.image_points(), &k)
                .map_err(|e| CalibrationError::pose(image, format!("undistortion failed: {}", e)))?;
            let pinhole = CameraIntrinsics::new(
                LensModel::RadTan,
                k,
                camera.get_resolution(),
                &[0.0; 5],
            )?;
            PoseOptimizationCost::new(
                pinhole,
                points3d,
                Matrix2xX::from_columns(&undistorted),
                self.config.solver.clone(),
            )
        } else {
            PoseOptimizationCost::new(
                camera.clone(),
                points3d,
                Matrix2xX::from_columns(set.image_points()),
                self.config.solver.clone(),
            )
        };

        cost.linear_estimation()
            .map_err(|e| CalibrationError::pose(image, format!("initialisation failed: {}", e)))?;
        cost.optimize(self.config.solver.verbosity > 0)
            .map_err(|e| CalibrationError::pose(image, format!("did not converge: {}", e)))?;

        let depth = cost.min_depth();
        if depth <= 0.0 {
            return Err(CalibrationError::pose(
                image,
                format!("pattern lies behind the camera (min depth {:.4} m)", depth),
            ));
        }

        let pattern_to_camera = cost.pose();
        let errors = view_reprojection_errors(camera, &pattern_to_camera, &set.to_view())
            .map_err(|e| CalibrationError::pose(image, format!("reprojection failed: {}", e)))?;
        let rms_error = ProjectionError::from_errors(&errors)?.rmse;

        if !(rms_error <= self.config.max_rms_px) {
            warn!(
                "Pose of image '{}' rejected: RMS {:.3} px > {:.3} px",
                image, rms_error, self.config.max_rms_px
            );
            return Err(CalibrationError::pose(
                image,
                format!(
                    "reprojection RMS {:.3} px exceeds {:.3} px",
                    rms_error, self.config.max_rms_px
                ),
            ));
        }

        debug!(
            "Pose of image '{}': t = [{:.4}, {:.4}, {:.4}], RMS {:.4} px",
            image,
            pattern_to_camera.translation().x,
            pattern_to_camera.translation().y,
            pattern_to_camera.translation().z,
            rms_error
        );
        Ok(PoseSolution {
            pattern_to_camera,
            rms_error,
        })
    }
}
