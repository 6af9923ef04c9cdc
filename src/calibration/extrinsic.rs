//! Camera-to-vehicle extrinsics.
//!
//! An [`ExtrinsicEngine`] starts unresolved and reaches its resolved state
//! through one of three entries:
//!
//! * manual: the operator measures the camera pose in the vehicle frame
//! * pattern: a pose solve against a pattern whose vehicle-frame placement
//!   is known
//! * load: a previously persisted transform
//!
//! Composition order is fixed. With `pattern_to_camera` from the pose solver:
//!
//! ```text
//! pattern_to_vehicle = placement (outer) . axis_remap (inner)
//! camera_to_vehicle  = pattern_to_vehicle (outer) . inverse(pattern_to_camera) (inner)
//! ```

use log::{info, warn};
use nalgebra::Vector3;

use crate::calibration::{
    CorrespondenceSet, ExtrinsicConfig, ExtrinsicResult, PointTransformer, PoseSolution, PoseSolver,
};
use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{AngleUnit, AxisRemap, EulerAngles, RigidTransform, VEHICLE_EULER_ORDER};
use crate::persistence::ExtrinsicDocument;

/// Declared pose of the calibration pattern in the vehicle frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternPlacement {
    /// Pattern origin in vehicle coordinates, metres.
    pub position: Vector3<f64>,
    /// Board orientation in the vehicle frame, [`VEHICLE_EULER_ORDER`].
    pub orientation: EulerAngles,
    /// Pattern basis expressed in the vehicle basis before `orientation`.
    pub axis_remap: AxisRemap,
    /// Accepted for compatibility with existing rigs; it has no defined
    /// meaning and is ignored.
    pub rear_axle_offset: Option<Vector3<f64>>,
}

impl PatternPlacement {
    /// Placement with the standard checkerboard remap.
    pub fn new(position: Vector3<f64>, orientation: EulerAngles) -> Self {
        PatternPlacement {
            position,
            orientation,
            axis_remap: AxisRemap::CHECKERBOARD_TO_VEHICLE,
            rear_axle_offset: None,
        }
    }

    pub fn with_axis_remap(mut self, axis_remap: AxisRemap) -> Self {
        self.axis_remap = axis_remap;
        self
    }

    pub fn with_rear_axle_offset(mut self, offset: Vector3<f64>) -> Self {
        self.rear_axle_offset = Some(offset);
        self
    }

    pub fn pattern_to_vehicle(&self) -> RigidTransform {
        RigidTransform::from_euler(&self.orientation, VEHICLE_EULER_ORDER, self.position)
            .compose(&self.axis_remap.as_transform())
    }
}

/// Outcome of [`ExtrinsicEngine::from_pattern_batch`].
#[derive(Debug)]
pub struct PatternBatchReport {
    pub result: ExtrinsicResult,
    /// Image whose pose produced `result`.
    pub selected_image: String,
    pub selected_rms: f64,
    /// One entry per image that could not be used, in input order. Each
    /// carries its image id.
    pub failures: Vec<CalibrationError>,
}

/// Resolves and holds one camera's camera-to-vehicle transform.
///
/// A failed attempt leaves the previously resolved transform in place.
#[derive(Debug, Clone, Default)]
pub struct ExtrinsicEngine {
    pose_solver: PoseSolver,
    resolved: Option<ExtrinsicResult>,
}

impl ExtrinsicEngine {
    pub fn new(config: ExtrinsicConfig) -> Self {
        ExtrinsicEngine {
            pose_solver: PoseSolver::new(config.pose),
            resolved: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn result(&self) -> Result<&ExtrinsicResult, CalibrationError> {
        self.resolved.as_ref().ok_or(CalibrationError::NotCalibrated)
    }

    /// Transformer for the resolved transform; unresolved engines hand out
    /// a transformer that fails every call.
    pub fn point_transformer(&self) -> PointTransformer {
        match &self.resolved {
            Some(result) => PointTransformer::new(result.camera_to_vehicle),
            None => PointTransformer::unresolved(),
        }
    }

    fn resolve(&mut self, camera_to_vehicle: RigidTransform) -> ExtrinsicResult {
        let result = ExtrinsicResult::new(camera_to_vehicle);
        let [roll, pitch, yaw] = result.euler.to_degrees();
        let t = camera_to_vehicle.translation();
        info!(
            "Camera-to-vehicle resolved: t = [{:.4}, {:.4}, {:.4}] m, rpy = [{:.3}, {:.3}, {:.3}] deg",
            t.x, t.y, t.z, roll, pitch, yaw
        );
        self.resolved = Some(result);
        result
    }

    /// Manual path: the camera's position and orientation measured directly
    /// in the vehicle frame.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidInput`] for non-finite values.
    pub fn from_manual_measurement(
        &mut self,
        position: Vector3<f64>,
        roll: f64,
        pitch: f64,
        yaw: f64,
        unit: AngleUnit,
    ) -> Result<ExtrinsicResult, CalibrationError> {
        let orientation = EulerAngles::from_unit(roll, pitch, yaw, unit);
        if !position.iter().all(|v| v.is_finite()) || !orientation.is_finite() {
            return Err(CalibrationError::InvalidInput(format!(
                "manual measurement must be finite: position {:?}, rpy [{}, {}, {}]",
                position.as_slice(),
                roll,
                pitch,
                yaw
            )));
        }
        info!("Resolving extrinsics from manual measurement");
        Ok(self.resolve(RigidTransform::from_euler(
            &orientation,
            VEHICLE_EULER_ORDER,
            position,
        )))
    }

    fn camera_to_vehicle(
        solution: &PoseSolution,
        pattern_to_vehicle: &RigidTransform,
    ) -> RigidTransform {
        let camera_to_pattern = solution.pattern_to_camera.inverse();
        pattern_to_vehicle.compose(&camera_to_pattern)
    }

    /// Pattern path with an already composed pattern-to-vehicle transform.
    pub fn from_pnp(
        &mut self,
        set: &CorrespondenceSet,
        camera: &CameraIntrinsics,
        pattern_to_vehicle: &RigidTransform,
    ) -> Result<ExtrinsicResult, CalibrationError> {
        let solution = self.pose_solver.solve(set, camera)?;
        info!(
            "Resolving extrinsics from image '{}' (pose RMS {:.4} px)",
            set.image_id(),
            solution.rms_error
        );
        Ok(self.resolve(Self::camera_to_vehicle(&solution, pattern_to_vehicle)))
    }

    /// Pattern path from the pattern's declared vehicle-frame placement.
    pub fn from_pattern(
        &mut self,
        set: &CorrespondenceSet,
        camera: &CameraIntrinsics,
        placement: &PatternPlacement,
    ) -> Result<ExtrinsicResult, CalibrationError> {
        warn_unused_offset(placement);
        self.from_pnp(set, camera, &placement.pattern_to_vehicle())
    }

    /// Runs the pattern path on every image and keeps the pose with the
    /// lowest reprojection RMS. Per-image failures are collected, not fatal.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InsufficientData`] when no image yields a pose.
    pub fn from_pattern_batch(
        &mut self,
        sets: &[CorrespondenceSet],
        camera: &CameraIntrinsics,
        placement: &PatternPlacement,
    ) -> Result<PatternBatchReport, CalibrationError> {
        warn_unused_offset(placement);

        let mut best: Option<(&CorrespondenceSet, PoseSolution)> = None;
        let mut failures = Vec::new();
        for set in sets {
            match self.pose_solver.solve(set, camera) {
                Ok(solution) => {
                    let better = best
                        .as_ref()
                        .map_or(true, |(_, b)| solution.rms_error < b.rms_error);
                    if better {
                        best = Some((set, solution));
                    }
                }
                Err(err) => {
                    warn!("Skipping image '{}': {}", set.image_id(), err);
                    let err = if err.is_per_image() {
                        err
                    } else {
                        CalibrationError::pose(set.image_id(), err.to_string())
                    };
                    failures.push(err);
                }
            }
        }

        let Some((set, solution)) = best else {
            return Err(CalibrationError::InsufficientData {
                context: "images with a valid pattern pose".to_string(),
                required: 1,
                actual: 0,
            });
        };

        info!(
            "Resolving extrinsics from image '{}' of {} (pose RMS {:.4} px, {} failed)",
            set.image_id(),
            sets.len(),
            solution.rms_error,
            failures.len()
        );
        let result = self.resolve(Self::camera_to_vehicle(
            &solution,
            &placement.pattern_to_vehicle(),
        ));
        Ok(PatternBatchReport {
            result,
            selected_image: set.image_id().to_string(),
            selected_rms: solution.rms_error,
            failures,
        })
    }

    /// Reinstates a persisted transform without solving.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::MalformedTransform`] if the stored rotation is not
    /// orthonormal or disagrees with the stored homogeneous matrix.
    pub fn load_from(&mut self, document: &ExtrinsicDocument) -> Result<ExtrinsicResult, CalibrationError> {
        let transform = document.to_transform()?;
        info!("Resolving extrinsics from persisted transform");
        Ok(self.resolve(transform))
    }
}

fn warn_unused_offset(placement: &PatternPlacement) {
    if let Some(offset) = placement.rear_axle_offset {
        warn!(
            "rear_axle_offset [{:.3}, {:.3}, {:.3}] is ignored; give the pattern position relative to the rear axle",
            offset.x, offset.y, offset.z
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::synthetic::observe;
    use crate::calibration::PatternGeometry;
    use crate::camera::{Intrinsics, LensModel, Resolution};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(
            LensModel::RadTan,
            Intrinsics {
                fx: 820.0,
                fy: 800.0,
                cx: 640.0,
                cy: 360.0,
            },
            Resolution {
                width: 1280,
                height: 720,
            },
            &[-0.12, 0.05, 0.001, -0.0008, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn test_manual_path() {
        let mut engine = ExtrinsicEngine::default();
        assert!(matches!(engine.result(), Err(CalibrationError::NotCalibrated)));

        let result = engine
            .from_manual_measurement(Vector3::new(1.5, 0.0, 1.8), 0.0, -10.0, 0.0, AngleUnit::Degrees)
            .unwrap();
        assert_eq!(*result.camera_to_vehicle.translation(), Vector3::new(1.5, 0.0, 1.8));
        let [roll, pitch, yaw] = result.euler.to_degrees();
        assert_relative_eq!(roll, 0.0, epsilon = 1e-6);
        assert_relative_eq!(pitch, -10.0, epsilon = 1e-6);
        assert_relative_eq!(yaw, 0.0, epsilon = 1e-6);

        let radians = ExtrinsicEngine::default()
            .from_manual_measurement(
                Vector3::new(1.5, 0.0, 1.8),
                0.0,
                (-10.0f64).to_radians(),
                0.0,
                AngleUnit::Radians,
            )
            .unwrap();
        assert_relative_eq!(
            *radians.camera_to_vehicle.rotation(),
            *result.camera_to_vehicle.rotation(),
            epsilon = 1e-12
        );

        assert!(engine
            .from_manual_measurement(Vector3::new(f64::NAN, 0.0, 0.0), 0.0, 0.0, 0.0, AngleUnit::Degrees)
            .is_err());
        // The failed attempt keeps the earlier result.
        assert_eq!(*engine.result().unwrap(), result);
    }

    #[test]
    fn test_pattern_to_vehicle_composition() {
        let placement = PatternPlacement::new(
            Vector3::new(3.0, 0.5, 1.2),
            EulerAngles::from_degrees(0.0, 0.0, 180.0),
        );
        let t = placement.pattern_to_vehicle();
        let expected = Matrix3::new(
            0.0, 0.0, -1.0, //
            1.0, 0.0, 0.0, //
            0.0, -1.0, 0.0,
        );
        assert_relative_eq!(*t.rotation(), expected, epsilon = 1e-12);
        assert_eq!(*t.translation(), Vector3::new(3.0, 0.5, 1.2));
    }

    #[test]
    fn test_frontal_pattern_gives_remap_rotation() {
        // Camera looks straight at the board's origin from 2 m; board frame
        // and camera frame share their axes.
        let pattern = PatternGeometry::default();
        let camera = camera();
        let pattern_to_camera = RigidTransform::new(Matrix3::identity(), Vector3::new(-0.1, -0.06, 2.0)).unwrap();
        let set = observe("front", &camera, &pattern, &pattern_to_camera, 0.0).unwrap();

        let placement = PatternPlacement::new(Vector3::new(5.0, 0.2, 1.0), EulerAngles::default())
            .with_rear_axle_offset(Vector3::new(0.1, 0.0, 0.0));
        let mut engine = ExtrinsicEngine::default();
        let result = engine.from_pattern(&set, &camera, &placement).unwrap();

        let remap = AxisRemap::CHECKERBOARD_TO_VEHICLE;
        assert_relative_eq!(
            *result.camera_to_vehicle.rotation(),
            *remap.matrix(),
            epsilon = 1e-6
        );
        // Camera centre = placement + remap * (-t_pattern_to_camera).
        let expected = Vector3::new(5.0, 0.2, 1.0) + remap.apply(&Vector3::new(0.1, 0.06, -2.0));
        assert_relative_eq!(*result.camera_to_vehicle.translation(), expected, epsilon = 1e-6);
        assert_relative_eq!(expected, Vector3::new(3.0, 0.1, 0.94), epsilon = 1e-12);

        let vehicle = engine
            .point_transformer()
            .transform_point(&Vector3::zeros())
            .unwrap();
        assert_relative_eq!(vehicle, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_batch_reports_failures_and_picks_best() {
        let pattern = PatternGeometry::default();
        let camera = camera();
        let pose = RigidTransform::new(Matrix3::identity(), Vector3::new(-0.1, -0.06, 1.0)).unwrap();
        let noisy = observe("noisy", &camera, &pattern, &pose, 0.8).unwrap();
        let clean = observe("clean", &camera, &pattern, &pose, 0.0).unwrap();
        let broken = CorrespondenceSet::new(
            "broken",
            clean.object_points()[..2].to_vec(),
            clean.image_points()[..2].to_vec(),
        )
        .unwrap();

        let placement = PatternPlacement::new(Vector3::new(3.0, 0.0, 1.0), EulerAngles::default());
        let mut engine = ExtrinsicEngine::default();
        let report = engine
            .from_pattern_batch(&[noisy, broken.clone(), clean], &camera, &placement)
            .unwrap();
        assert_eq!(report.selected_image, "clean");
        assert!(report.selected_rms < 1e-4);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].is_per_image());
        assert_eq!(report.failures[0].image(), Some("broken"));
        assert!(engine.is_resolved());

        let mut empty = ExtrinsicEngine::default();
        assert!(matches!(
            empty.from_pattern_batch(&[broken], &camera, &placement),
            Err(CalibrationError::InsufficientData { .. })
        ));
        assert!(!empty.is_resolved());
    }
}
