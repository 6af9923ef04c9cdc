//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This is the Brown-Conrady model used for standard (non-fisheye) vehicle
//! cameras. It adheres to the [`CameraModel`] trait defined in the parent
//! `camera` module ([`crate::camera`]).

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// The distortion coefficients are ordered `[k1, k2, p1, p2, k3]`:
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use vehicle_camera_calib::camera::rad_tan::RadTanModel;
/// use vehicle_camera_calib::camera::Resolution;
///
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0, // Intrinsics
///     0.1, -0.05, 0.001, 0.001, 0.02 // Distortion (k1, k2, p1, p2, k3)
/// ]);
/// let model = RadTanModel::new(&params, Resolution { width: 640, height: 480 }).unwrap();
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.distortions[0], 0.1);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from a vector of parameters.
    ///
    /// # Arguments
    ///
    /// * `parameters` - `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    /// * `resolution` - Image size the parameters were estimated for.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if fewer than 9 values are given, or
    /// any error raised by `validate_params`.
    pub fn new(parameters: &DVector<f64>, resolution: Resolution) -> Result<Self, CameraModelError> {
        if parameters.len() < 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "RadTan model needs 9 parameters, got {}",
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution,
            distortions: [
                parameters[4], // k1
                parameters[5], // k2
                parameters[6], // p1
                parameters[7], // p2
                parameters[8], // k3
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Applies the distortion polynomial to a point on the normalized image plane.
    pub fn distort(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let x = normalized.x;
        let y = normalized.y;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates, applying distortion.
    ///
    /// Points projecting outside the image are still returned; callers that
    /// care about visibility check against [`Resolution::contains`].
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.intrinsics.to_pixel(&self.distort(&normalized)))
    }

    /// Unprojects a distorted pixel to a unit ray in camera coordinates.
    ///
    /// Inverts the distortion with Newton iterations starting from the
    /// distorted normalized point.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: If the Jacobian becomes singular
    ///   or the iteration does not converge.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        let target = self.intrinsics.to_normalized(point_2d);
        let mut point = target;

        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let mut converged = false;
        for _ in 0..MAX_ITERATIONS {
            let error = self.distort(&point) - target;
            if error.norm() < EPS {
                converged = true;
                break;
            }

            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            // d(radial)/d(r2)
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;
            let jacobian = Matrix2::new(j00, j01, j10, j11);

            let Some(inv_jacobian) = jacobian.try_inverse() else {
                return Err(CameraModelError::NumericalError(
                    "Jacobian is singular".to_string(),
                ));
            };
            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < EPS {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(CameraModelError::NumericalError(format!(
                "Unprojection did not converge after {} iterations.",
                MAX_ITERATIONS
            )));
        }

        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_coefficients(&self.distortions)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    /// Returns the coefficients in the order `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}
