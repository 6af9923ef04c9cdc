//! Camera projection models used by the calibration engine.
//!
//! Two lens models are supported: the radial-tangential (Brown-Conrady)
//! model used for standard lenses and the Kannala-Brandt equidistant model
//! used for wide-angle/fisheye lenses. [`CameraIntrinsics`] wraps either of
//! them and is what the rest of the crate passes around.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod kannala_brandt;
pub mod rad_tan;

pub use kannala_brandt::KannalaBrandtModel;
pub use rad_tan::RadTanModel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// The 3x3 camera matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Pixel coordinates of a point on the normalized image plane.
    pub fn to_pixel(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * normalized.x + self.cx,
            self.fy * normalized.y + self.cy,
        )
    }

    /// Normalized image-plane coordinates of a pixel, ignoring distortion.
    pub fn to_normalized(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn contains(&self, point: &Vector2<f64>) -> bool {
        point.x >= 0.0
            && point.x < self.width as f64
            && point.y >= 0.0
            && point.y < self.height as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to pixel coordinates.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_coefficients(coefficients: &[f64]) -> Result<(), CameraModelError> {
        if let Some(i) = coefficients.iter().position(|k| !k.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "distortion coefficient {} is not finite",
                i
            )));
        }
        Ok(())
    }
}

/// Lens family a [`CameraIntrinsics`] is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensModel {
    /// Brown-Conrady radial-tangential distortion, `[k1, k2, p1, p2, k3]`.
    #[default]
    RadTan,
    /// Kannala-Brandt equidistant fisheye distortion, `[k1, k2, k3, k4]`.
    KannalaBrandt,
}

impl LensModel {
    /// Number of distortion coefficients of the model.
    pub fn num_coefficients(&self) -> usize {
        match self {
            LensModel::RadTan => 5,
            LensModel::KannalaBrandt => 4,
        }
    }

    /// Whether pose solving must first undistort observations into an
    /// equivalent pinhole projection.
    pub fn is_wide_angle(&self) -> bool {
        matches!(self, LensModel::KannalaBrandt)
    }
}

/// Solved camera projection model: focal lengths, principal point, lens
/// distortion and image dimensions.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraIntrinsics {
    RadTan(RadTanModel),
    KannalaBrandt(KannalaBrandtModel),
}

impl CameraIntrinsics {
    /// Builds a validated camera from its parts.
    ///
    /// `distortion` must hold exactly [`LensModel::num_coefficients`] values.
    pub fn new(
        lens: LensModel,
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortion: &[f64],
    ) -> Result<Self, CameraModelError> {
        if distortion.len() != lens.num_coefficients() {
            return Err(CameraModelError::InvalidParams(format!(
                "{:?} expects {} distortion coefficients, got {}",
                lens,
                lens.num_coefficients(),
                distortion.len()
            )));
        }
        let camera = match lens {
            LensModel::RadTan => CameraIntrinsics::RadTan(RadTanModel {
                intrinsics,
                resolution,
                distortions: [
                    distortion[0],
                    distortion[1],
                    distortion[2],
                    distortion[3],
                    distortion[4],
                ],
            }),
            LensModel::KannalaBrandt => CameraIntrinsics::KannalaBrandt(KannalaBrandtModel {
                intrinsics,
                resolution,
                distortions: [distortion[0], distortion[1], distortion[2], distortion[3]],
            }),
        };
        camera.validate_params()?;
        Ok(camera)
    }

    pub fn lens(&self) -> LensModel {
        match self {
            CameraIntrinsics::RadTan(_) => LensModel::RadTan,
            CameraIntrinsics::KannalaBrandt(_) => LensModel::KannalaBrandt,
        }
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.get_intrinsics().matrix()
    }

    fn model(&self) -> &dyn CameraModel {
        match self {
            CameraIntrinsics::RadTan(model) => model,
            CameraIntrinsics::KannalaBrandt(model) => model,
        }
    }
}

impl CameraModel for CameraIntrinsics {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        self.model().project(point_3d)
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        self.model().unproject(point_2d)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        self.model().validate_params()
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model().get_intrinsics()
    }

    fn get_resolution(&self) -> Resolution {
        self.model().get_resolution()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model().get_distortion()
    }
}

/// Maps distorted pixel observations to the pixels an ideal pinhole camera
/// with matrix `new_intrinsics` would have observed.
pub fn undistort_points(
    camera: &dyn CameraModel,
    points: &[Vector2<f64>],
    new_intrinsics: &Intrinsics,
) -> Result<Vec<Vector2<f64>>, CameraModelError> {
    points
        .iter()
        .map(|p| {
            let ray = camera.unproject(p)?;
            if ray.z < f64::EPSILON.sqrt() {
                return Err(CameraModelError::PointAtCameraCenter);
            }
            Ok(new_intrinsics.to_pixel(&Vector2::new(ray.x / ray.z, ray.y / ray.z)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 610.0,
            fy: 605.0,
            cx: 640.0,
            cy: 360.0,
        }
    }

    fn sample_resolution() -> Resolution {
        Resolution {
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn test_camera_intrinsics_rejects_wrong_coefficient_count() {
        let result = CameraIntrinsics::new(
            LensModel::KannalaBrandt,
            sample_intrinsics(),
            sample_resolution(),
            &[0.0; 5],
        );
        assert!(matches!(result, Err(CameraModelError::InvalidParams(_))));
    }

    #[test]
    fn test_camera_intrinsics_rejects_non_positive_focal_length() {
        let mut intrinsics = sample_intrinsics();
        intrinsics.fy = 0.0;
        let result =
            CameraIntrinsics::new(LensModel::RadTan, intrinsics, sample_resolution(), &[0.0; 5]);
        assert!(matches!(
            result,
            Err(CameraModelError::FocalLengthMustBePositive)
        ));

        intrinsics.fy = f64::NAN;
        let result =
            CameraIntrinsics::new(LensModel::RadTan, intrinsics, sample_resolution(), &[0.0; 5]);
        assert!(result.is_err());
    }

    #[test]
    fn test_camera_matrix_layout() {
        let camera = CameraIntrinsics::new(
            LensModel::RadTan,
            sample_intrinsics(),
            sample_resolution(),
            &[0.0; 5],
        )
        .unwrap();
        let k = camera.camera_matrix();
        assert_eq!(k[(0, 0)], 610.0);
        assert_eq!(k[(1, 1)], 605.0);
        assert_eq!(k[(0, 2)], 640.0);
        assert_eq!(k[(1, 2)], 360.0);
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(k[(0, 1)], 0.0);
    }

    #[test]
    fn test_undistort_points_matches_pinhole_projection() {
        let camera = CameraIntrinsics::new(
            LensModel::KannalaBrandt,
            sample_intrinsics(),
            sample_resolution(),
            &[0.02, -0.01, 0.004, -0.001],
        )
        .unwrap();
        let intrinsics = sample_intrinsics();

        let points_3d = [
            Vector3::new(0.3, -0.2, 1.0),
            Vector3::new(-0.5, 0.4, 1.5),
            Vector3::new(0.05, 0.01, 2.0),
        ];
        let distorted: Vec<_> = points_3d
            .iter()
            .map(|p| camera.project(p).unwrap())
            .collect();
        let undistorted = undistort_points(&camera, &distorted, &intrinsics).unwrap();

        for (p, u) in points_3d.iter().zip(undistorted.iter()) {
            let expected = intrinsics.to_pixel(&Vector2::new(p.x / p.z, p.y / p.z));
            assert_relative_eq!(u.x, expected.x, epsilon = 1e-6);
            assert_relative_eq!(u.y, expected.y, epsilon = 1e-6);
        }
    }
}
