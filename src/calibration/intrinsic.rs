//! Accumulates per-image correspondences and solves for the camera.

use log::{debug, info, warn};
use nalgebra::Vector2;

use crate::calibration::{
    CorrespondenceSet, CoverageAnalyzer, CoverageReport, IntrinsicConfig, IntrinsicResult,
};
use crate::camera::Resolution;
use crate::error::CalibrationError;
use crate::optimization::intrinsics::view_reprojection_errors;
use crate::optimization::pose::PLANARITY_TOLERANCE;
use crate::optimization::{Optimizer, PlanarCalibrationCost, ProjectionError};

/// Minimum number of accepted images for a well-posed intrinsic solve.
pub const MIN_CALIBRATION_IMAGES: usize = 3;

/// Largest in-plane distance, in metres, between an object point and its
/// pattern corner.
const GRID_TOLERANCE: f64 = 1e-6;

/// Owns the accepted correspondence sets of one calibration session.
///
/// Not shared between sessions; each camera gets its own accumulator.
#[derive(Debug, Clone)]
pub struct IntrinsicAccumulator {
    config: IntrinsicConfig,
    accepted: Vec<CorrespondenceSet>,
    rejected: Vec<String>,
}

impl IntrinsicAccumulator {
    pub fn new(config: IntrinsicConfig) -> Result<Self, CalibrationError> {
        config.pattern.validate()?;
        Ok(IntrinsicAccumulator {
            config,
            accepted: Vec::new(),
            rejected: Vec::new(),
        })
    }

    pub fn config(&self) -> &IntrinsicConfig {
        &self.config
    }

    /// Appends `set` if it holds one correspondence per pattern corner, in
    /// grid order, on the `z = 0` plane.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::DetectionFailure`] for an empty or incomplete set,
    /// or one whose object points are off the plane or off the configured
    /// grid. The image is recorded in
    /// [`rejected_images`](Self::rejected_images) and contributes nothing.
    pub fn add(&mut self, set: CorrespondenceSet) -> Result<(), CalibrationError> {
        let expected = self.config.pattern.point_count();
        let reason = if set.is_empty() {
            Some("no correspondences".to_string())
        } else if set.len() != expected {
            Some(format!(
                "{} correspondences, pattern has {} corners",
                set.len(),
                expected
            ))
        } else if let Some(k) = set
            .object_points()
            .iter()
            .position(|p| p.z.abs() > PLANARITY_TOLERANCE)
        {
            Some(format!(
                "pattern point {} is off the z = 0 plane (z = {})",
                k,
                set.object_points()[k].z
            ))
        } else if let Some(k) = set
            .object_points()
            .iter()
            .zip(self.config.pattern.object_points())
            .position(|(p, corner)| (p.xy() - corner.xy()).norm() > GRID_TOLERANCE)
        {
            Some(format!(
                "pattern point {} does not match the {}x{} grid",
                k, self.config.pattern.cols, self.config.pattern.rows
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!("Rejecting image '{}': {}", set.image_id(), reason);
            self.rejected.push(set.image_id().to_string());
            return Err(CalibrationError::detection(set.image_id(), reason));
        }

        debug!(
            "Accepted image '{}' ({} points)",
            set.image_id(),
            set.len()
        );
        self.accepted.push(set);
        Ok(())
    }

    /// Consumes a detector result: `None` means the pattern was not found.
    pub fn add_detection(
        &mut self,
        image_id: &str,
        corners: Option<Vec<Vector2<f64>>>,
    ) -> Result<(), CalibrationError> {
        let Some(corners) = corners else {
            warn!("Rejecting image '{}': pattern not found", image_id);
            self.rejected.push(image_id.to_string());
            return Err(CalibrationError::detection(image_id, "pattern not found"));
        };
        if corners.len() != self.config.pattern.point_count() {
            // Goes through `add` so the rejection is recorded once.
            let partial = CorrespondenceSet::new(
                image_id,
                self.config
                    .pattern
                    .object_points()
                    .into_iter()
                    .take(corners.len())
                    .collect(),
                corners,
            )?;
            return self.add(partial);
        }
        let set = CorrespondenceSet::from_grid(image_id, &self.config.pattern, corners)?;
        self.add(set)
    }

    pub fn accepted(&self) -> &[CorrespondenceSet] {
        &self.accepted
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn rejected_images(&self) -> &[String] {
        &self.rejected
    }

    /// Joint solve over every accepted image.
    ///
    /// The result depends only on the ordered accepted sets and the solver
    /// options, but is not bit-identical between runs: `tiny_solver` orders
    /// the Jacobian columns through a randomly seeded `HashMap`, so repeated
    /// solves agree to about `1e-12` relative rather than bitwise.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientData`] with fewer than
    ///   [`MIN_CALIBRATION_IMAGES`] accepted images.
    /// * [`CalibrationError::Camera`] if the solver fails or diverges.
    pub fn solve(&self, image_width: u32, image_height: u32) -> Result<IntrinsicResult, CalibrationError> {
        if self.accepted.len() < MIN_CALIBRATION_IMAGES {
            return Err(CalibrationError::InsufficientData {
                context: "intrinsic calibration images".to_string(),
                required: MIN_CALIBRATION_IMAGES,
                actual: self.accepted.len(),
            });
        }
        let resolution = Resolution {
            width: image_width,
            height: image_height,
        };
        if image_width == 0 || image_height == 0 {
            return Err(CalibrationError::InvalidInput(format!(
                "image size must be non-zero, got {}x{}",
                image_width, image_height
            )));
        }

        info!(
            "Solving {:?} intrinsics from {} images ({} rejected)",
            self.config.lens,
            self.accepted.len(),
            self.rejected.len()
        );

        let views = self.accepted.iter().map(|s| s.to_view()).collect();
        let mut cost =
            PlanarCalibrationCost::new(self.config.lens, resolution, views, self.config.solver.clone());
        cost.linear_estimation()?;
        cost.optimize(self.config.solver.verbosity > 0)?;

        let errors = cost.reprojection_errors()?;
        let rms_error = ProjectionError::from_errors(&errors)?.rmse;
        let camera = cost.camera()?;

        info!(
            "Intrinsic solve finished: fx={:.3} fy={:.3} cx={:.3} cy={:.3}, RMS {:.4} px",
            cost.get_intrinsics().fx,
            cost.get_intrinsics().fy,
            cost.get_intrinsics().cx,
            cost.get_intrinsics().cy,
            rms_error
        );

        Ok(IntrinsicResult {
            camera,
            rms_error,
            image_ids: self
                .accepted
                .iter()
                .map(|s| s.image_id().to_string())
                .collect(),
            view_poses: cost.poses().to_vec(),
        })
    }

    /// Pixel distance of every accepted point under `result`, in image order.
    fn point_errors(&self, result: &IntrinsicResult) -> Result<Vec<f64>, CalibrationError> {
        let ids_match = result.image_ids.len() == self.accepted.len()
            && result.view_poses.len() == self.accepted.len()
            && result
                .image_ids
                .iter()
                .zip(self.accepted.iter())
                .all(|(id, set)| id == set.image_id());
        if !ids_match {
            return Err(CalibrationError::InvalidInput(
                "result was not solved from this accumulator's images".to_string(),
            ));
        }

        let mut errors = Vec::new();
        for (set, pose) in self.accepted.iter().zip(result.view_poses.iter()) {
            errors.extend(view_reprojection_errors(&result.camera, pose, &set.to_view())?);
        }
        Ok(errors)
    }

    /// Mean pixel distance over all accepted points under `result`.
    pub fn reprojection_error(&self, result: &IntrinsicResult) -> Result<f64, CalibrationError> {
        Ok(ProjectionError::from_errors(&self.point_errors(result)?)?.mean)
    }

    pub fn reprojection_statistics(
        &self,
        result: &IntrinsicResult,
    ) -> Result<ProjectionError, CalibrationError> {
        ProjectionError::from_errors(&self.point_errors(result)?)
    }

    pub fn coverage(&self, analyzer: &CoverageAnalyzer, resolution: &Resolution) -> CoverageReport {
        analyzer.analyze_sets(&self.accepted, resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::synthetic::calibration_views;
    use crate::calibration::PatternGeometry;
    use crate::camera::{CameraIntrinsics, CameraModel, Intrinsics, LensModel};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn truth(lens: LensModel) -> CameraIntrinsics {
        let distortion: &[f64] = match lens {
            LensModel::RadTan => &[-0.12, 0.05, 0.001, -0.0008, 0.0],
            LensModel::KannalaBrandt => &[0.03, -0.01, 0.002, -0.0005],
        };
        CameraIntrinsics::new(
            lens,
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
            distortion,
        )
        .unwrap()
    }

    fn accumulator(lens: LensModel) -> IntrinsicAccumulator {
        IntrinsicAccumulator::new(IntrinsicConfig {
            lens,
            ..IntrinsicConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_add_rejects_incomplete_sets() {
        let mut acc = accumulator(LensModel::RadTan);
        let pattern = acc.config().pattern;

        let empty = CorrespondenceSet::new("empty", vec![], vec![]).unwrap();
        assert!(matches!(
            acc.add(empty),
            Err(CalibrationError::DetectionFailure { .. })
        ));

        let partial = acc.add_detection("partial", Some(vec![Vector2::new(1.0, 2.0); 10]));
        assert!(matches!(
            partial,
            Err(CalibrationError::DetectionFailure { ref image, .. }) if image == "partial"
        ));

        assert!(acc.add_detection("missing", None).unwrap_err().is_per_image());

        let full = vec![Vector2::new(1.0, 2.0); pattern.point_count()];
        acc.add_detection("full", Some(full)).unwrap();

        assert_eq!(acc.accepted_count(), 1);
        assert_eq!(acc.rejected_images(), ["empty", "partial", "missing"]);
    }

    #[test]
    fn test_add_rejects_points_off_the_pattern() {
        let camera = truth(LensModel::RadTan);
        let mut acc = accumulator(LensModel::RadTan);
        let view = calibration_views(&camera, &acc.config().pattern, 0.5, 1, 0.0)
            .unwrap()
            .remove(0);

        let bent: Vec<Vector3<f64>> = view
            .object_points()
            .iter()
            .map(|p| Vector3::new(p.x, p.y, 0.5 * p.x))
            .collect();
        let bent = CorrespondenceSet::new("bent", bent, view.image_points().to_vec()).unwrap();
        let err = acc.add(bent).unwrap_err();
        assert!(matches!(err, CalibrationError::DetectionFailure { ref image, .. } if image == "bent"));

        let mut reversed = view.object_points().to_vec();
        reversed.reverse();
        let reversed =
            CorrespondenceSet::new("reversed", reversed, view.image_points().to_vec()).unwrap();
        assert!(matches!(
            acc.add(reversed),
            Err(CalibrationError::DetectionFailure { .. })
        ));

        assert_eq!(acc.accepted_count(), 0);
        assert_eq!(acc.rejected_images(), ["bent", "reversed"]);
        acc.add(view).unwrap();
        assert_eq!(acc.accepted_count(), 1);
    }

    #[test]
    fn test_solve_requires_three_images() {
        let camera = truth(LensModel::RadTan);
        let views =
            calibration_views(&camera, &PatternGeometry::default(), 0.5, 2, 0.0).unwrap();
        let mut acc = accumulator(LensModel::RadTan);
        for n in 0..=2 {
            let err = acc.solve(1280, 720).unwrap_err();
            assert!(matches!(
                err,
                CalibrationError::InsufficientData { required: 3, actual, .. } if actual == n
            ));
            if n < 2 {
                acc.add(views[n].clone()).unwrap();
            }
        }
    }

    #[test]
    fn test_solve_recovers_camera() {
        for lens in [LensModel::RadTan, LensModel::KannalaBrandt] {
            let camera = truth(lens);
            let mut acc = accumulator(lens);
            for set in calibration_views(&camera, &acc.config().pattern, 0.5, 6, 0.0).unwrap() {
                acc.add(set).unwrap();
            }
            let result = acc.solve(1280, 720).unwrap();
            let k = result.camera.get_intrinsics();
            assert!((k.fx - 820.0).abs() < 0.5, "{:?}: fx = {}", lens, k.fx);
            assert!((k.cy - 360.0).abs() < 0.5, "{:?}: cy = {}", lens, k.cy);
            assert!(result.rms_error < 1e-2, "{:?}: rms {}", lens, result.rms_error);
            assert_eq!(result.camera.lens(), lens);
            assert_eq!(result.image_ids.len(), 6);

            let mean = acc.reprojection_error(&result).unwrap();
            assert!(mean <= result.rms_error + 1e-12);
            let stats = acc.reprojection_statistics(&result).unwrap();
            assert!((stats.rmse - result.rms_error).abs() < 1e-9);
        }
    }

    #[test]
    fn test_repeated_solves_agree() {
        let camera = truth(LensModel::RadTan);
        let mut acc = accumulator(LensModel::RadTan);
        for set in calibration_views(&camera, &acc.config().pattern, 0.5, 6, 0.3).unwrap() {
            acc.add(set).unwrap();
        }
        let first = acc.solve(1280, 720).unwrap();
        for _ in 0..4 {
            let again = acc.solve(1280, 720).unwrap();
            assert_relative_eq!(
                again.camera.camera_matrix(),
                first.camera.camera_matrix(),
                max_relative = 1e-9
            );
            for (a, b) in again
                .camera
                .get_distortion()
                .iter()
                .zip(first.camera.get_distortion().iter())
            {
                assert_relative_eq!(*a, *b, epsilon = 1e-9);
            }
            assert_relative_eq!(again.rms_error, first.rms_error, max_relative = 1e-9);
            assert_eq!(again.image_ids, first.image_ids);
        }
    }

    #[test]
    fn test_reprojection_error_rejects_foreign_result() {
        let camera = truth(LensModel::RadTan);
        let views = calibration_views(&camera, &PatternGeometry::default(), 0.5, 4, 0.0).unwrap();
        let mut acc = accumulator(LensModel::RadTan);
        for set in views.iter().take(3) {
            acc.add(set.clone()).unwrap();
        }
        let result = acc.solve(1280, 720).unwrap();
        acc.add(views[3].clone()).unwrap();
        assert!(matches!(
            acc.reprojection_error(&result),
            Err(CalibrationError::InvalidInput(_))
        ));
    }
}
