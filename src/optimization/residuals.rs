//! Generic reprojection residuals evaluated by `tiny_solver` with dual numbers.
//!
//! Parameter block layouts:
//! * intrinsics: `[fx, fy, cx, cy]`
//! * distortion: `[k1, k2, p1, p2, k3]` (RadTan) or `[k1, k2, k3, k4]` (Kannala-Brandt)
//! * pose: `[qx, qy, qz, qw, tx, ty, tz]`, pattern frame to camera frame

use nalgebra::{DVector, Quaternion, RealField, UnitQuaternion, Vector2, Vector3};
use tiny_solver::factors::Factor;

use crate::camera::LensModel;

#[inline]
fn lift<T: RealField>(v: f64) -> T {
    nalgebra::convert(v)
}

/// Maps a pattern-frame point into the camera frame.
pub(crate) fn transform_se3<T: RealField>(pose: &DVector<T>, point: &Vector3<f64>) -> Vector3<T> {
    let quat = Quaternion::new(
        pose[3].clone(),
        pose[0].clone(),
        pose[1].clone(),
        pose[2].clone(),
    );
    let rot = UnitQuaternion::from_quaternion(quat);
    let t = Vector3::new(pose[4].clone(), pose[5].clone(), pose[6].clone());
    let p = Vector3::new(lift::<T>(point.x), lift::<T>(point.y), lift::<T>(point.z));
    rot.transform_vector(&p) + t
}

fn distort_rad_tan<T: RealField>(x: T, y: T, dist: &DVector<T>) -> (T, T) {
    let k1 = dist[0].clone();
    let k2 = dist[1].clone();
    let p1 = dist[2].clone();
    let p2 = dist[3].clone();
    let k3 = dist[4].clone();

    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;

    let two = lift::<T>(2.0);
    let xy = x.clone() * y.clone();
    let x_tan = two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
    let y_tan = p1 * (r2 + two.clone() * y.clone() * y.clone()) + two * p2 * xy;

    (x * radial.clone() + x_tan, y * radial + y_tan)
}

/// Normalised distorted coordinates of a camera-frame point under the
/// equidistant model.
fn distort_kannala_brandt<T: RealField>(p: &Vector3<T>, dist: &DVector<T>) -> (T, T) {
    let r2 = p.x.clone() * p.x.clone() + p.y.clone() * p.y.clone();
    // Near the optical axis theta_d / r tends to 1 / z; avoids sqrt(0) in the
    // dual part.
    if r2 < lift::<T>(1e-18) {
        return (p.x.clone() / p.z.clone(), p.y.clone() / p.z.clone());
    }
    let r = r2.sqrt();
    let theta = r.clone().atan2(p.z.clone());
    let theta2 = theta.clone() * theta.clone();

    let poly = T::one()
        + theta2.clone()
            * (dist[0].clone()
                + theta2.clone()
                    * (dist[1].clone()
                        + theta2.clone() * (dist[2].clone() + theta2 * dist[3].clone())));
    let scale = theta * poly / r;
    (p.x.clone() * scale.clone(), p.y.clone() * scale)
}

/// Pixel projection of a camera-frame point.
pub(crate) fn project_generic<T: RealField>(
    lens: LensModel,
    intrinsics: &DVector<T>,
    distortion: &DVector<T>,
    p: &Vector3<T>,
) -> Vector2<T> {
    let (xd, yd) = match lens {
        LensModel::RadTan => {
            let eps = lift::<T>(1e-12);
            let z = if p.z.clone() > eps.clone() { p.z.clone() } else { eps };
            distort_rad_tan(p.x.clone() / z.clone(), p.y.clone() / z, distortion)
        }
        LensModel::KannalaBrandt => distort_kannala_brandt(p, distortion),
    };
    Vector2::new(
        intrinsics[0].clone() * xd + intrinsics[2].clone(),
        intrinsics[1].clone() * yd + intrinsics[3].clone(),
    )
}

/// One observed pattern corner with camera and pose both free.
///
/// Parameter blocks: `[intrinsics, distortion, pose]`.
#[derive(Debug, Clone)]
pub(crate) struct ReprojectionFactor {
    pub lens: LensModel,
    pub object: Vector3<f64>,
    pub observed: Vector2<f64>,
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pc = transform_se3(&params[2], &self.object);
        let projected = project_generic(self.lens, &params[0], &params[1], &pc);
        DVector::from_vec(vec![
            projected.x.clone() - lift::<T>(self.observed.x),
            projected.y.clone() - lift::<T>(self.observed.y),
        ])
    }
}

/// One observed pattern corner seen by a fixed, already calibrated camera.
///
/// Parameter blocks: `[pose]`.
#[derive(Debug, Clone)]
pub(crate) struct FixedCameraFactor {
    pub lens: LensModel,
    pub intrinsics: [f64; 4],
    pub distortion: Vec<f64>,
    pub object: Vector3<f64>,
    pub observed: Vector2<f64>,
}

impl<T: RealField> Factor<T> for FixedCameraFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let intrinsics = DVector::from_iterator(4, self.intrinsics.iter().map(|v| lift::<T>(*v)));
        let distortion = DVector::from_iterator(
            self.distortion.len(),
            self.distortion.iter().map(|v| lift::<T>(*v)),
        );
        let pc = transform_se3(&params[0], &self.object);
        let projected = project_generic(self.lens, &intrinsics, &distortion, &pc);
        DVector::from_vec(vec![
            projected.x.clone() - lift::<T>(self.observed.x),
            projected.y.clone() - lift::<T>(self.observed.y),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, CameraModel, Intrinsics, Resolution};
    use crate::geometry::{EulerAngles, RigidTransform, VEHICLE_EULER_ORDER};
    use approx::assert_relative_eq;

    fn check_against_camera(camera: &CameraIntrinsics) {
        let pose = RigidTransform::from_euler(
            &EulerAngles::from_degrees(12.0, -20.0, 7.0),
            VEHICLE_EULER_ORDER,
            Vector3::new(-0.1, 0.05, 0.8),
        );
        let k = camera.get_intrinsics();
        let intrinsics = DVector::from_vec(vec![k.fx, k.fy, k.cx, k.cy]);
        let distortion = DVector::from_vec(camera.get_distortion());
        let pose_params = pose.to_se3_params();

        for object in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.24, 0.0, 0.0),
            Vector3::new(0.12, 0.15, 0.0),
        ] {
            let expected = camera.project(&pose.transform_point(&object)).unwrap();
            let pc = transform_se3(&pose_params, &object);
            let projected = project_generic(camera.lens(), &intrinsics, &distortion, &pc);
            assert_relative_eq!(projected, expected, epsilon = 1e-9);

            let factor = ReprojectionFactor {
                lens: camera.lens(),
                object,
                observed: expected,
            };
            let residual = factor.residual_func(&[
                intrinsics.clone(),
                distortion.clone(),
                pose_params.clone(),
            ]);
            assert!(residual.norm() < 1e-9);
        }
    }

    #[test]
    fn test_generic_projection_matches_camera_models() {
        let intrinsics = Intrinsics {
            fx: 820.0,
            fy: 800.0,
            cx: 640.0,
            cy: 360.0,
        };
        let resolution = Resolution {
            width: 1280,
            height: 720,
        };
        let rad_tan = CameraIntrinsics::new(
            LensModel::RadTan,
            intrinsics,
            resolution,
            &[-0.12, 0.05, 0.001, -0.0008, 0.01],
        )
        .unwrap();
        let kb = CameraIntrinsics::new(
            LensModel::KannalaBrandt,
            intrinsics,
            resolution,
            &[0.03, -0.01, 0.002, -0.0005],
        )
        .unwrap();
        check_against_camera(&rad_tan);
        check_against_camera(&kb);
    }
}
