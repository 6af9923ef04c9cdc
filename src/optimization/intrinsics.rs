//! Joint refinement of camera intrinsics and per-view pattern poses.
//!
//! Every observed corner contributes one 2-dimensional residual block over the
//! shared `intrinsics` and `distortion` blocks and its view's `pose_<i>` block.
//! Poses live on `tiny_solver`'s SE(3) manifold.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix2xX, Matrix3xX, Vector2};
use std::collections::HashMap;
use std::sync::Arc;
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::camera::{
    CameraIntrinsics, CameraModel, CameraModelError, Intrinsics, LensModel, Resolution,
};
use crate::error::CalibrationError;
use crate::geometry::{estimate_homography, initial_intrinsics, pose_from_homography, RigidTransform};
use crate::optimization::residuals::ReprojectionFactor;
use crate::optimization::{Optimizer, SolverOptions};

/// Pattern corners (`3xN`, pattern frame) and their observed pixels (`2xN`)
/// for one image.
#[derive(Debug, Clone)]
pub struct PlanarView {
    pub points3d: Matrix3xX<f64>,
    pub points2d: Matrix2xX<f64>,
}

/// Cost function for joint intrinsic calibration over several pattern views.
#[derive(Clone)]
pub struct PlanarCalibrationCost {
    lens: LensModel,
    resolution: Resolution,
    intrinsics: Intrinsics,
    distortion: Vec<f64>,
    views: Vec<PlanarView>,
    /// One pattern-to-camera transform per view, same order as `views`.
    poses: Vec<RigidTransform>,
    options: SolverOptions,
}

impl PlanarCalibrationCost {
    /// Creates a cost with a placeholder estimate; call
    /// [`linear_estimation`](Optimizer::linear_estimation) before optimizing.
    pub fn new(
        lens: LensModel,
        resolution: Resolution,
        views: Vec<PlanarView>,
        options: SolverOptions,
    ) -> Self {
        let f = resolution.width.max(resolution.height) as f64;
        PlanarCalibrationCost {
            lens,
            resolution,
            intrinsics: Intrinsics {
                fx: f,
                fy: f,
                cx: resolution.width as f64 / 2.0,
                cy: resolution.height as f64 / 2.0,
            },
            distortion: vec![0.0; lens.num_coefficients()],
            poses: vec![RigidTransform::identity(); views.len()],
            views,
            options,
        }
    }

    /// The current estimate as a validated camera.
    pub fn camera(&self) -> Result<CameraIntrinsics, CalibrationError> {
        Ok(CameraIntrinsics::new(
            self.lens,
            self.intrinsics,
            self.resolution,
            &self.distortion,
        )?)
    }

    pub fn poses(&self) -> &[RigidTransform] {
        &self.poses
    }

    /// Per-view pixel distances under the current estimate.
    pub fn view_errors(&self) -> Result<Vec<Vec<f64>>, CalibrationError> {
        let camera = self.camera()?;
        self.views
            .iter()
            .zip(self.poses.iter())
            .map(|(view, pose)| view_reprojection_errors(&camera, pose, view))
            .collect()
    }

    fn rms(&self) -> Result<f64, CalibrationError> {
        let errors = self.reprojection_errors()?;
        Ok((errors.iter().map(|e| e * e).sum::<f64>() / errors.len().max(1) as f64).sqrt())
    }

    fn check_views(&self) -> Result<(), CalibrationError> {
        if self.views.len() < 3 {
            return Err(CalibrationError::InsufficientData {
                context: "intrinsic calibration views".to_string(),
                required: 3,
                actual: self.views.len(),
            });
        }
        for (i, view) in self.views.iter().enumerate() {
            if view.points3d.ncols() != view.points2d.ncols() {
                return Err(CalibrationError::InvalidInput(format!(
                    "view {} has {} pattern points but {} image points",
                    i,
                    view.points3d.ncols(),
                    view.points2d.ncols()
                )));
            }
            if view.points3d.ncols() < 4 {
                return Err(CalibrationError::InsufficientData {
                    context: format!("points in view {}", i),
                    required: 4,
                    actual: view.points3d.ncols(),
                });
            }
        }
        Ok(())
    }

    /// Least-squares fit of the distortion coefficients with intrinsics and
    /// poses held fixed. Tangential terms of the RadTan model stay at zero.
    fn fit_distortion(&self) -> Option<Vec<f64>> {
        let n: usize = self.views.iter().map(|v| v.points3d.ncols()).sum();
        let unknowns = match self.lens {
            LensModel::RadTan => 3,
            LensModel::KannalaBrandt => 4,
        };
        let mut a_mat = DMatrix::zeros(n * 2, unknowns);
        let mut b_vec = DVector::zeros(n * 2);
        let k = self.intrinsics;

        let mut row = 0;
        for (view, pose) in self.views.iter().zip(self.poses.iter()) {
            for (p3d, p2d) in view.points3d.column_iter().zip(view.points2d.column_iter()) {
                let pc = pose.transform_point(&p3d.into_owned());
                if pc.z <= f64::EPSILON {
                    return None;
                }
                let du = p2d[0] - k.cx;
                let dv = p2d[1] - k.cy;
                match self.lens {
                    LensModel::RadTan => {
                        let x = pc.x / pc.z;
                        let y = pc.y / pc.z;
                        let r2 = x * x + y * y;
                        let powers = [r2, r2 * r2, r2 * r2 * r2];
                        for (j, p) in powers.iter().enumerate() {
                            a_mat[(row, j)] = k.fx * x * p;
                            a_mat[(row + 1, j)] = k.fy * y * p;
                        }
                        b_vec[row] = du - k.fx * x;
                        b_vec[row + 1] = dv - k.fy * y;
                    }
                    LensModel::KannalaBrandt => {
                        let r = (pc.x * pc.x + pc.y * pc.y).sqrt();
                        let theta = r.atan2(pc.z);
                        let (x_r, y_r) = if r < f64::EPSILON {
                            (0.0, 0.0)
                        } else {
                            (pc.x / r, pc.y / r)
                        };
                        let theta2 = theta * theta;
                        let theta3 = theta2 * theta;
                        let powers = [
                            theta3,
                            theta3 * theta2,
                            theta3 * theta2 * theta2,
                            theta3 * theta2 * theta2 * theta2,
                        ];
                        for (j, p) in powers.iter().enumerate() {
                            a_mat[(row, j)] = k.fx * x_r * p;
                            a_mat[(row + 1, j)] = k.fy * y_r * p;
                        }
                        b_vec[row] = du - k.fx * theta * x_r;
                        b_vec[row + 1] = dv - k.fy * theta * y_r;
                    }
                }
                row += 2;
            }
        }

        let svd = a_mat.svd(true, true);
        let solution = svd.solve(&b_vec, 1e-12).ok()?;
        if !solution.iter().all(|v| v.is_finite()) {
            return None;
        }

        Some(match self.lens {
            LensModel::RadTan => vec![solution[0], solution[1], 0.0, 0.0, solution[2]],
            LensModel::KannalaBrandt => solution.iter().copied().collect(),
        })
    }
}

/// Pixel distance of every corner of `view` under `camera` and `pose`.
pub(crate) fn view_reprojection_errors(
    camera: &CameraIntrinsics,
    pose: &RigidTransform,
    view: &PlanarView,
) -> Result<Vec<f64>, CalibrationError> {
    view.points3d
        .column_iter()
        .zip(view.points2d.column_iter())
        .map(|(p3d, p2d)| {
            let projected = camera.project(&pose.transform_point(&p3d.into_owned()))?;
            Ok((projected - Vector2::new(p2d[0], p2d[1])).norm())
        })
        .collect()
}

impl Optimizer for PlanarCalibrationCost {
    /// Refines intrinsics, distortion and every view pose together.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientData`] with fewer than 3 views.
    /// * [`CalibrationError::Camera`] if the solver diverges into an invalid
    ///   camera (e.g. a non-positive focal length).
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        self.check_views()?;

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "intrinsics".to_string(),
            DVector::from_vec(vec![
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
            ]),
        );
        initial_values.insert(
            "distortion".to_string(),
            DVector::from_vec(self.distortion.clone()),
        );

        let mut num_blocks = 0;
        for (i, (view, pose)) in self.views.iter().zip(self.poses.iter()).enumerate() {
            let pose_key = format!("pose_{}", i);
            problem.set_variable_manifold(&pose_key, Arc::new(SE3Manifold));
            initial_values.insert(pose_key.clone(), pose.to_se3_params());

            for (p3d, p2d) in view.points3d.column_iter().zip(view.points2d.column_iter()) {
                let factor = ReprojectionFactor {
                    lens: self.lens,
                    object: p3d.into_owned(),
                    observed: Vector2::new(p2d[0], p2d[1]),
                };
                problem.add_residual_block(
                    2,
                    &["intrinsics", "distortion", pose_key.as_str()],
                    Box::new(factor),
                    None,
                );
                num_blocks += 1;
            }
        }

        if verbose {
            info!(
                "Starting intrinsic refinement: {} views, {} residual blocks, initial RMS {:.4} px",
                self.views.len(),
                num_blocks,
                self.rms()?
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

        let missing = |key: &str| {
            CalibrationError::InvalidInput(format!("solver returned no value for '{}'", key))
        };
        let intrinsics = result
            .get("intrinsics")
            .ok_or_else(|| missing("intrinsics"))?;
        let distortion = result
            .get("distortion")
            .ok_or_else(|| missing("distortion"))?;

        let mut poses = Vec::with_capacity(self.views.len());
        for i in 0..self.views.len() {
            let key = format!("pose_{}", i);
            let params = result.get(&key).ok_or_else(|| missing(&key))?;
            poses.push(RigidTransform::from_se3_params(params)?);
        }

        let refined = Intrinsics {
            fx: intrinsics[0],
            fy: intrinsics[1],
            cx: intrinsics[2],
            cy: intrinsics[3],
        };
        // Validates before committing.
        CameraIntrinsics::new(self.lens, refined, self.resolution, distortion.as_slice())?;

        self.intrinsics = refined;
        self.distortion = distortion.iter().copied().collect();
        self.poses = poses;

        if verbose {
            info!("Intrinsic refinement finished, RMS {:.4} px", self.rms()?);
        }
        Ok(())
    }

    /// Closed-form initialisation.
    ///
    /// Homographies give Zhang's pinhole intrinsics and one pose per view;
    /// the distortion coefficients are then fitted linearly and kept only if
    /// they lower the reprojection RMS.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        self.check_views()?;

        let homographies = self
            .views
            .iter()
            .map(|view| {
                let plane: Vec<Vector2<f64>> = view
                    .points3d
                    .column_iter()
                    .map(|p| Vector2::new(p[0], p[1]))
                    .collect();
                let image: Vec<Vector2<f64>> = view
                    .points2d
                    .column_iter()
                    .map(|p| Vector2::new(p[0], p[1]))
                    .collect();
                estimate_homography(&plane, &image)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.intrinsics = initial_intrinsics(&homographies, &self.resolution)?;
        self.distortion = vec![0.0; self.lens.num_coefficients()];

        let k_inv = self.intrinsics.matrix().try_inverse().ok_or_else(|| {
            CalibrationError::InvalidInput("initial camera matrix is singular".to_string())
        })?;
        self.poses = homographies
            .iter()
            .map(|h| pose_from_homography(&(k_inv * h)))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, pose) in self.poses.iter().enumerate() {
            debug!(
                "view {} initial pose: t = [{:.4}, {:.4}, {:.4}]",
                i,
                pose.translation().x,
                pose.translation().y,
                pose.translation().z
            );
        }

        let baseline = self.rms()?;
        if let Some(distortion) = self.fit_distortion() {
            let previous = std::mem::replace(&mut self.distortion, distortion);
            match self.rms() {
                Ok(rms) if rms < baseline => {
                    debug!(
                        "linear distortion fit {:?} lowers RMS {:.4} -> {:.4} px",
                        self.distortion, baseline, rms
                    );
                }
                _ => self.distortion = previous,
            }
        } else {
            warn!("linear distortion fit failed, starting from zero distortion");
        }
        Ok(())
    }

    fn reprojection_errors(&self) -> Result<Vec<f64>, CalibrationError> {
        Ok(self.view_errors()?.into_iter().flatten().collect())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortion.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{EulerAngles, VEHICLE_EULER_ORDER};
    use nalgebra::Vector3;

    fn ground_truth(lens: LensModel) -> CameraIntrinsics {
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

    fn views(camera: &CameraIntrinsics) -> Vec<PlanarView> {
        let angles = [
            (20.0, -10.0, 5.0),
            (-15.0, 25.0, -8.0),
            (5.0, -30.0, 12.0),
            (-25.0, 5.0, 0.0),
            (10.0, 15.0, -15.0),
        ];
        angles
            .iter()
            .map(|&(roll, pitch, yaw)| {
                let pose = RigidTransform::from_euler(
                    &EulerAngles::from_degrees(roll, pitch, yaw),
                    VEHICLE_EULER_ORDER,
                    Vector3::new(-0.12, -0.075, 0.6),
                );
                let mut p3 = Vec::new();
                let mut p2 = Vec::new();
                for r in 0..6 {
                    for c in 0..9 {
                        let p = Vector3::new(c as f64 * 0.03, r as f64 * 0.03, 0.0);
                        p2.push(camera.project(&pose.transform_point(&p)).unwrap());
                        p3.push(p);
                    }
                }
                PlanarView {
                    points3d: Matrix3xX::from_columns(&p3),
                    points2d: Matrix2xX::from_columns(&p2),
                }
            })
            .collect()
    }

    #[test]
    fn test_planar_calibration_recovers_camera() {
        for lens in [LensModel::RadTan, LensModel::KannalaBrandt] {
            let truth = ground_truth(lens);
            let mut cost =
                PlanarCalibrationCost::new(lens, truth.get_resolution(), views(&truth), SolverOptions::default());
            cost.linear_estimation().unwrap();
            cost.optimize(false).unwrap();

            let k = cost.get_intrinsics();
            assert!((k.fx - 820.0).abs() < 0.5, "{:?}: fx = {}", lens, k.fx);
            assert!((k.fy - 800.0).abs() < 0.5, "{:?}: fy = {}", lens, k.fy);
            assert!((k.cx - 640.0).abs() < 0.5, "{:?}: cx = {}", lens, k.cx);
            assert!((k.cy - 360.0).abs() < 0.5, "{:?}: cy = {}", lens, k.cy);

            let errors = cost.reprojection_errors().unwrap();
            assert_eq!(errors.len(), 5 * 54);
            assert!(errors.iter().all(|e| *e < 1e-2), "{:?}", lens);
        }
    }

    #[test]
    fn test_planar_calibration_requires_three_views() {
        let truth = ground_truth(LensModel::RadTan);
        let mut all = views(&truth);
        all.truncate(2);
        let mut cost =
            PlanarCalibrationCost::new(LensModel::RadTan, truth.get_resolution(), all, SolverOptions::default());
        assert!(matches!(
            cost.linear_estimation(),
            Err(CalibrationError::InsufficientData { required: 3, actual: 2, .. })
        ));
        assert!(matches!(
            cost.optimize(false),
            Err(CalibrationError::InsufficientData { .. })
        ));
    }
}
