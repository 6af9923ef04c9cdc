//! Kannala-Brandt equidistant fisheye model.
//!
//! The distorted incidence angle is an odd polynomial in the true angle
//! `theta` between the ray and the optical axis:
//!
//! `theta_d = theta * (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`
//!
//! and the pixel lies at radius `theta_d` on the normalized plane.

use nalgebra::{DVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KannalaBrandtModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// `[k1, k2, k3, k4]`
    pub distortions: [f64; 4],
}

impl KannalaBrandtModel {
    /// Creates a model from `[fx, fy, cx, cy, k1, k2, k3, k4]`.
    pub fn new(parameters: &DVector<f64>, resolution: Resolution) -> Result<Self, CameraModelError> {
        if parameters.len() < 8 {
            return Err(CameraModelError::InvalidParams(format!(
                "Kannala-Brandt model needs 8 parameters, got {}",
                parameters.len()
            )));
        }
        let model = KannalaBrandtModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution,
            distortions: [parameters[4], parameters[5], parameters[6], parameters[7]],
        };
        model.validate_params()?;
        Ok(model)
    }

    fn theta_d(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.distortions;
        let theta2 = theta * theta;
        theta
            * (1.0
                + theta2 * (k1 + theta2 * (k2 + theta2 * (k3 + theta2 * k4))))
    }

    fn theta_d_derivative(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.distortions;
        let theta2 = theta * theta;
        1.0 + theta2 * (3.0 * k1 + theta2 * (5.0 * k2 + theta2 * (7.0 * k3 + theta2 * 9.0 * k4)))
    }
}

impl CameraModel for KannalaBrandtModel {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let r = (point_3d.x * point_3d.x + point_3d.y * point_3d.y).sqrt();
        if r < f64::EPSILON {
            return Ok(Vector2::new(self.intrinsics.cx, self.intrinsics.cy));
        }

        let theta = r.atan2(point_3d.z);
        let theta_d = self.theta_d(theta);
        let normalized = Vector2::new(theta_d * point_3d.x / r, theta_d * point_3d.y / r);
        Ok(self.intrinsics.to_pixel(&normalized))
    }

    /// Inverts the angle polynomial with Newton iterations on `theta`.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let normalized = self.intrinsics.to_normalized(point_2d);
        let theta_d = normalized.norm();
        if theta_d < f64::EPSILON {
            return Ok(Vector3::new(0.0, 0.0, 1.0));
        }

        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 50;

        let mut theta = theta_d;
        let mut converged = false;
        for _ in 0..MAX_ITERATIONS {
            let derivative = self.theta_d_derivative(theta);
            if derivative.abs() < f64::EPSILON {
                return Err(CameraModelError::NumericalError(
                    "Angle polynomial derivative vanished".to_string(),
                ));
            }
            let step = (self.theta_d(theta) - theta_d) / derivative;
            theta -= step;
            if step.abs() < EPS {
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
        if !(0.0..std::f64::consts::FRAC_PI_2).contains(&theta) {
            return Err(CameraModelError::NumericalError(format!(
                "Recovered incidence angle {:.4} rad is outside the forward hemisphere",
                theta
            )));
        }

        let scale = theta.sin() / theta_d;
        Ok(Vector3::new(
            normalized.x * scale,
            normalized.y * scale,
            theta.cos(),
        ))
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_coefficients(&self.distortions)?;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> KannalaBrandtModel {
        let params = DVector::from_vec(vec![
            348.0, 347.5, 640.2, 400.7, 0.0376, -0.0087, 0.0035, -0.0007,
        ]);
        KannalaBrandtModel::new(
            &params,
            Resolution {
                width: 1280,
                height: 800,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_kb_principal_axis_projects_to_principal_point() {
        let model = sample_model();
        let p = model.project(&Vector3::new(0.0, 0.0, 3.0)).unwrap();
        assert_relative_eq!(p.x, 640.2);
        assert_relative_eq!(p.y, 400.7);
    }

    #[test]
    fn test_kb_project_unproject() {
        let model = sample_model();
        let points = [
            Vector3::new(0.5, -0.3, 2.0),
            Vector3::new(-1.0, 0.8, 1.0),
            Vector3::new(2.0, 1.5, 1.0), // ~68 degrees off axis
            Vector3::new(0.001, 0.0, 1.0),
        ];

        for point in points.iter() {
            let pixel = model.project(point).unwrap();
            let ray = model.unproject(&pixel).unwrap();
            let expected = point.normalize();
            assert_relative_eq!(ray, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_kb_zero_coefficients_is_equidistant() {
        let params = DVector::from_vec(vec![300.0, 300.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0]);
        let model = KannalaBrandtModel::new(
            &params,
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap();
        // 45 degrees off axis lands at radius f * pi / 4.
        let p = model.project(&Vector3::new(1.0, 0.0, 1.0)).unwrap();
        assert_relative_eq!(p.x, 320.0 + 300.0 * std::f64::consts::FRAC_PI_4, epsilon = 1e-9);
        assert_relative_eq!(p.y, 240.0, epsilon = 1e-9);
    }
}
