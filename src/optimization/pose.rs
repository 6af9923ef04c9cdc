//! Single-view pose refinement against a fixed camera.

use log::{debug, info};
use nalgebra::{DVector, Matrix2xX, Matrix3xX, Vector2};
use std::collections::HashMap;
use std::sync::Arc;
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::camera::{CameraIntrinsics, CameraModel, CameraModelError, Intrinsics, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{estimate_homography, pose_from_homography, RigidTransform};
use crate::optimization::intrinsics::{view_reprojection_errors, PlanarView};
use crate::optimization::residuals::FixedCameraFactor;
use crate::optimization::{Optimizer, SolverOptions};

/// Pattern points further than this from `z = 0` make the view non-planar.
pub(crate) const PLANARITY_TOLERANCE: f64 = 1e-9;

/// Cost function for the pattern-to-camera pose of one planar view.
#[derive(Clone)]
pub struct PoseOptimizationCost {
    camera: CameraIntrinsics,
    view: PlanarView,
    pose: RigidTransform,
    options: SolverOptions,
}

impl PoseOptimizationCost {
    /// # Arguments
    ///
    /// * `camera` - Calibrated camera; never modified.
    /// * `points3d` - Pattern corners in the pattern frame, all with `z = 0`.
    /// * `points2d` - Observed pixels, same order as `points3d`.
    pub fn new(
        camera: CameraIntrinsics,
        points3d: Matrix3xX<f64>,
        points2d: Matrix2xX<f64>,
        options: SolverOptions,
    ) -> Self {
        PoseOptimizationCost {
            camera,
            view: PlanarView { points3d, points2d },
            pose: RigidTransform::identity(),
            options,
        }
    }

    /// Current pattern-to-camera estimate.
    pub fn pose(&self) -> RigidTransform {
        self.pose
    }

    /// Smallest depth of any pattern corner under the current pose.
    pub fn min_depth(&self) -> f64 {
        self.view
            .points3d
            .column_iter()
            .map(|p| self.pose.transform_point(&p.into_owned()).z)
            .fold(f64::INFINITY, f64::min)
    }

    fn check_input(&self) -> Result<(), CalibrationError> {
        let n = self.view.points3d.ncols();
        if n != self.view.points2d.ncols() {
            return Err(CalibrationError::InvalidInput(format!(
                "{} pattern points but {} image points",
                n,
                self.view.points2d.ncols()
            )));
        }
        if n < 4 {
            return Err(CalibrationError::InsufficientData {
                context: "pose solve correspondences".to_string(),
                required: 4,
                actual: n,
            });
        }
        if self
            .view
            .points3d
            .row(2)
            .iter()
            .any(|z| z.abs() > PLANARITY_TOLERANCE)
        {
            return Err(CalibrationError::InvalidInput(
                "pose solver expects planar pattern points with z = 0".to_string(),
            ));
        }
        if is_collinear(&self.view.points3d) {
            return Err(CalibrationError::InvalidInput(
                "pattern points are collinear".to_string(),
            ));
        }
        Ok(())
    }
}

/// `true` when the pattern points span less than a 2D area.
fn is_collinear(points: &Matrix3xX<f64>) -> bool {
    let n = points.ncols() as f64;
    let mean = points.column_mean();
    let mut scatter = nalgebra::Matrix2::<f64>::zeros();
    for p in points.column_iter() {
        let d = Vector2::new(p[0] - mean[0], p[1] - mean[1]);
        scatter += d * d.transpose();
    }
    scatter /= n;
    let eig = scatter.symmetric_eigenvalues();
    let (small, large) = if eig[0] < eig[1] {
        (eig[0], eig[1])
    } else {
        (eig[1], eig[0])
    };
    large <= f64::EPSILON || small / large < 1e-8
}

impl Optimizer for PoseOptimizationCost {
    /// Refines the pose with the camera fixed.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Camera`] when the solver produces no solution.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        self.check_input()?;

        let k = self.camera.get_intrinsics();
        let distortion = self.camera.get_distortion();

        let mut problem = tiny_solver::Problem::new();
        problem.set_variable_manifold("pose", Arc::new(SE3Manifold));
        for (p3d, p2d) in self
            .view
            .points3d
            .column_iter()
            .zip(self.view.points2d.column_iter())
        {
            let factor = FixedCameraFactor {
                lens: self.camera.lens(),
                intrinsics: [k.fx, k.fy, k.cx, k.cy],
                distortion: distortion.clone(),
                object: p3d.into_owned(),
                observed: Vector2::new(p2d[0], p2d[1]),
            };
            problem.add_residual_block(2, &["pose"], Box::new(factor), None);
        }

        let mut initial_values = HashMap::new();
        initial_values.insert("pose".to_string(), self.pose.to_se3_params());

        if verbose {
            info!(
                "Starting pose refinement over {} points",
                self.view.points3d.ncols()
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.options.to_optimizer_options()),
            )
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;

        let params: &DVector<f64> = result.get("pose").ok_or_else(|| {
            CalibrationError::InvalidInput("solver returned no pose".to_string())
        })?;
        self.pose = RigidTransform::from_se3_params(params)?;

        if verbose {
            info!("Pose refinement finished");
        }
        Ok(())
    }

    /// Homography between the pattern plane and the unprojected observations.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        self.check_input()?;

        let plane: Vec<Vector2<f64>> = self
            .view
            .points3d
            .column_iter()
            .map(|p| Vector2::new(p[0], p[1]))
            .collect();
        let normalized = self
            .view
            .points2d
            .column_iter()
            .map(|p| {
                let ray = self.camera.unproject(&Vector2::new(p[0], p[1]))?;
                if ray.z <= f64::EPSILON {
                    return Err(CalibrationError::Camera(
                        CameraModelError::PointAtCameraCenter,
                    ));
                }
                Ok(Vector2::new(ray.x / ray.z, ray.y / ray.z))
            })
            .collect::<Result<Vec<_>, CalibrationError>>()?;

        let h = estimate_homography(&plane, &normalized)?;
        self.pose = pose_from_homography(&h)?;
        debug!(
            "initial pose: t = [{:.4}, {:.4}, {:.4}]",
            self.pose.translation().x,
            self.pose.translation().y,
            self.pose.translation().z
        );
        Ok(())
    }

    fn reprojection_errors(&self) -> Result<Vec<f64>, CalibrationError> {
        view_reprojection_errors(&self.camera, &self.pose, &self.view)
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.camera.get_intrinsics()
    }

    fn get_resolution(&self) -> Resolution {
        self.camera.get_resolution()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.camera.get_distortion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::LensModel;
    use crate::geometry::{EulerAngles, VEHICLE_EULER_ORDER};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

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

    fn observe(camera: &CameraIntrinsics, pose: &RigidTransform) -> (Matrix3xX<f64>, Matrix2xX<f64>) {
        let mut p3 = Vec::new();
        let mut p2 = Vec::new();
        for r in 0..6 {
            for c in 0..9 {
                let p = Vector3::new(c as f64 * 0.03, r as f64 * 0.03, 0.0);
                p2.push(camera.project(&pose.transform_point(&p)).unwrap());
                p3.push(p);
            }
        }
        (Matrix3xX::from_columns(&p3), Matrix2xX::from_columns(&p2))
    }

    #[test]
    fn test_pose_refinement_recovers_pose() {
        let camera = camera();
        let truth = RigidTransform::from_euler(
            &EulerAngles::from_degrees(-20.0, 15.0, 4.0),
            VEHICLE_EULER_ORDER,
            Vector3::new(-0.1, -0.08, 0.9),
        );
        let (p3, p2) = observe(&camera, &truth);
        let mut cost = PoseOptimizationCost::new(camera, p3, p2, SolverOptions::default());
        cost.linear_estimation().unwrap();
        cost.optimize(false).unwrap();

        assert_relative_eq!(*cost.pose().rotation(), *truth.rotation(), epsilon = 1e-6);
        assert_relative_eq!(*cost.pose().translation(), *truth.translation(), epsilon = 1e-6);
        assert!(cost.reprojection_errors().unwrap().iter().all(|e| *e < 1e-4));
        assert!(cost.min_depth() > 0.0);
    }

    #[test]
    fn test_pose_rejects_degenerate_input() {
        let camera = camera();
        let line = Matrix3xX::from_columns(&[
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.1, 0.0, 0.0),
            Vector3::new(0.2, 0.0, 0.0),
            Vector3::new(0.3, 0.0, 0.0),
        ]);
        let pixels = Matrix2xX::from_columns(&[
            Vector2::new(600.0, 300.0),
            Vector2::new(650.0, 300.0),
            Vector2::new(700.0, 300.0),
            Vector2::new(750.0, 300.0),
        ]);
        let mut cost =
            PoseOptimizationCost::new(camera.clone(), line, pixels.clone(), SolverOptions::default());
        assert!(matches!(
            cost.linear_estimation(),
            Err(CalibrationError::InvalidInput(_))
        ));

        let three = Matrix3xX::from_columns(&[
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.1, 0.0, 0.0),
            Vector3::new(0.0, 0.1, 0.0),
        ]);
        let mut cost = PoseOptimizationCost::new(
            camera,
            three,
            pixels.columns(0, 3).into_owned(),
            SolverOptions::default(),
        );
        assert!(matches!(
            cost.optimize(false),
            Err(CalibrationError::InsufficientData { required: 4, actual: 3, .. })
        ));
    }
}
