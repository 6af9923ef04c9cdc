//! Rigid transforms between the pattern, camera and vehicle frames.
//!
//! A [`RigidTransform`] named `a_to_b` maps coordinates expressed in frame
//! `a` into frame `b`: `p_b = R * p_a + t`.

use nalgebra::{DVector, Matrix3, Matrix3xX, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3};

use crate::error::CalibrationError;
use crate::geometry::euler::{EulerAngles, RotationOrder};

/// Tolerance on `R^T R = I` and `det R = 1` for externally supplied rotations.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// Proper rigid motion. Immutable: new transforms come from [`compose`](Self::compose)
/// and [`inverse`](Self::inverse).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        RigidTransform {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Builds a transform from a rotation that is checked for orthonormality.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::MalformedTransform`] if any entry is not finite, the
    /// columns are not orthonormal, or the determinant is not +1, each within
    /// [`ORTHONORMAL_TOLERANCE`].
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Result<Self, CalibrationError> {
        check_rotation(&rotation)?;
        if !translation.iter().all(|v| v.is_finite()) {
            return Err(CalibrationError::MalformedTransform(
                "translation has non-finite entries".to_string(),
            ));
        }
        Ok(RigidTransform {
            rotation,
            translation,
        })
    }

    /// Builds a transform from a rotation produced internally (SO(3)
    /// projections, quaternions, Euler angles). The caller guarantees
    /// orthonormality.
    pub(crate) fn from_parts_unchecked(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        RigidTransform {
            rotation,
            translation,
        }
    }

    /// Reads a 4x4 homogeneous matrix. The bottom row must be `[0, 0, 0, 1]`.
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Result<Self, CalibrationError> {
        let bottom = matrix.fixed_view::<1, 4>(3, 0);
        let expected = [0.0, 0.0, 0.0, 1.0];
        if bottom
            .iter()
            .zip(expected.iter())
            .any(|(a, b)| (a - b).abs() > ORTHONORMAL_TOLERANCE)
        {
            return Err(CalibrationError::MalformedTransform(format!(
                "homogeneous bottom row is {:?}, expected [0, 0, 0, 1]",
                bottom.iter().collect::<Vec<_>>()
            )));
        }
        Self::new(
            matrix.fixed_view::<3, 3>(0, 0).into_owned(),
            matrix.fixed_view::<3, 1>(0, 3).into_owned(),
        )
    }

    pub fn from_euler(angles: &EulerAngles, order: RotationOrder, translation: Vector3<f64>) -> Self {
        RigidTransform {
            rotation: angles.to_matrix(order),
            translation,
        }
    }

    /// Builds a transform from tiny-solver's SE(3) layout
    /// `[qx, qy, qz, qw, tx, ty, tz]`.
    pub fn from_se3_params(params: &DVector<f64>) -> Result<Self, CalibrationError> {
        if params.len() != 7 {
            return Err(CalibrationError::InvalidInput(format!(
                "SE3 parameter block must have 7 entries, got {}",
                params.len()
            )));
        }
        let q = Quaternion::new(params[3], params[0], params[1], params[2]);
        if !(q.norm() > f64::EPSILON) || !params.iter().all(|v| v.is_finite()) {
            return Err(CalibrationError::MalformedTransform(
                "SE3 parameter block has a degenerate quaternion".to_string(),
            ));
        }
        let rotation = UnitQuaternion::from_quaternion(q).to_rotation_matrix();
        Ok(RigidTransform {
            rotation: rotation.into_inner(),
            translation: Vector3::new(params[4], params[5], params[6]),
        })
    }

    /// The inverse of [`from_se3_params`](Self::from_se3_params).
    pub fn to_se3_params(&self) -> DVector<f64> {
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
            self.rotation,
        ));
        let t = self.translation;
        DVector::from_vec(vec![q.i, q.j, q.k, q.w, t.x, t.y, t.z])
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// The 4x4 homogeneous matrix `[R t; 0 1]`.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// `self ∘ inner`: apply `inner` first, then `self`.
    ///
    /// With `inner: a -> b` and `self: b -> c` the result maps `a -> c`.
    /// `self` is the outer operand; the product is `self.matrix() * inner.matrix()`.
    pub fn compose(&self, inner: &RigidTransform) -> RigidTransform {
        let m = self.matrix() * inner.matrix();
        RigidTransform {
            rotation: m.fixed_view::<3, 3>(0, 0).into_owned(),
            translation: m.fixed_view::<3, 1>(0, 3).into_owned(),
        }
    }

    /// Exact algebraic inverse `[R^T, -R^T t]`.
    pub fn inverse(&self) -> RigidTransform {
        let rt = self.rotation.transpose();
        RigidTransform {
            rotation: rt,
            translation: -(rt * self.translation),
        }
    }

    pub fn euler_angles(&self, order: RotationOrder) -> EulerAngles {
        EulerAngles::from_matrix(&self.rotation, order)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Transforms every column of a `3xN` matrix.
    pub fn transform_points(&self, points: &Matrix3xX<f64>) -> Matrix3xX<f64> {
        let mut out = &self.rotation * points;
        for mut column in out.column_iter_mut() {
            column += self.translation;
        }
        out
    }

    /// Largest deviation of `R^T R` from the identity.
    pub fn orthonormality_error(&self) -> f64 {
        orthonormality_error(&self.rotation)
    }
}

pub(crate) fn orthonormality_error(rotation: &Matrix3<f64>) -> f64 {
    (rotation.transpose() * rotation - Matrix3::identity()).amax()
}

fn check_rotation(rotation: &Matrix3<f64>) -> Result<(), CalibrationError> {
    if !rotation.iter().all(|v| v.is_finite()) {
        return Err(CalibrationError::MalformedTransform(
            "rotation has non-finite entries".to_string(),
        ));
    }
    let error = orthonormality_error(rotation);
    if error > ORTHONORMAL_TOLERANCE {
        return Err(CalibrationError::MalformedTransform(format!(
            "rotation is not orthonormal: max |R^T R - I| = {:.3e}",
            error
        )));
    }
    let det = rotation.determinant();
    if (det - 1.0).abs() > ORTHONORMAL_TOLERANCE {
        return Err(CalibrationError::MalformedTransform(format!(
            "rotation determinant is {:.6}, expected +1",
            det
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::euler::VEHICLE_EULER_ORDER;
    use approx::assert_relative_eq;

    fn sample_transforms() -> Vec<RigidTransform> {
        vec![
            RigidTransform::identity(),
            RigidTransform::from_euler(
                &EulerAngles::from_degrees(0.0, -10.0, 0.0),
                VEHICLE_EULER_ORDER,
                Vector3::new(1.5, 0.0, 1.8),
            ),
            RigidTransform::from_euler(
                &EulerAngles::from_degrees(-92.0, 3.0, -88.5),
                VEHICLE_EULER_ORDER,
                Vector3::new(2.1, -0.35, 1.2),
            ),
            RigidTransform::from_euler(
                &EulerAngles::from_degrees(45.0, 89.9, 170.0),
                VEHICLE_EULER_ORDER,
                Vector3::new(-300.0, 12.5, 0.001),
            ),
        ]
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        for a in sample_transforms() {
            let left = a.compose(&a.inverse());
            let right = a.inverse().compose(&a);
            for product in [left, right] {
                assert_relative_eq!(*product.rotation(), Matrix3::identity(), epsilon = 1e-9);
                assert!(product.translation().norm() < 1e-9 * (1.0 + a.translation().norm()));
            }
        }
    }

    #[test]
    fn test_compose_yaw_and_translation_literal() {
        // A: yaw 90 deg then shift 1 m along X. B: pure shift 2 m along Y.
        let a = RigidTransform::from_euler(
            &EulerAngles::from_degrees(0.0, 0.0, 90.0),
            VEHICLE_EULER_ORDER,
            Vector3::new(1.0, 0.0, 0.0),
        );
        let b = RigidTransform::new(Matrix3::identity(), Vector3::new(0.0, 2.0, 0.0)).unwrap();

        let ab = a.compose(&b);
        let ba = b.compose(&a);

        let rz90 = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(*ab.rotation(), rz90, epsilon = 1e-12);
        assert_relative_eq!(*ab.translation(), Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(*ba.rotation(), rz90, epsilon = 1e-12);
        assert_relative_eq!(*ba.translation(), Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-12);
        assert!((ab.translation() - ba.translation()).norm() > 1.0);
    }

    #[test]
    fn test_compose_applies_inner_first() {
        let transforms = sample_transforms();
        let outer = transforms[1];
        let inner = transforms[2];
        let p = Vector3::new(0.3, -1.2, 4.0);
        let composed = outer.compose(&inner).transform_point(&p);
        let sequential = outer.transform_point(&inner.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }

    #[test]
    fn test_new_rejects_non_orthonormal_rotation() {
        let scaled = Matrix3::identity() * 1.01;
        assert!(matches!(
            RigidTransform::new(scaled, Vector3::zeros()),
            Err(CalibrationError::MalformedTransform(_))
        ));

        let reflection = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0);
        assert!(matches!(
            RigidTransform::new(reflection, Vector3::zeros()),
            Err(CalibrationError::MalformedTransform(_))
        ));

        let mut nan = Matrix3::identity();
        nan[(1, 2)] = f64::NAN;
        assert!(RigidTransform::new(nan, Vector3::zeros()).is_err());
    }

    #[test]
    fn test_homogeneous_matrix_round_trip() {
        for t in sample_transforms() {
            let restored = RigidTransform::from_matrix(&t.matrix()).unwrap();
            assert_relative_eq!(*restored.rotation(), *t.rotation(), epsilon = 1e-15);
            assert_relative_eq!(*restored.translation(), *t.translation(), epsilon = 1e-15);
        }

        let mut bad = Matrix4::identity();
        bad[(3, 0)] = 0.5;
        assert!(matches!(
            RigidTransform::from_matrix(&bad),
            Err(CalibrationError::MalformedTransform(_))
        ));
    }

    #[test]
    fn test_se3_params_round_trip() {
        for t in sample_transforms() {
            let params = t.to_se3_params();
            let restored = RigidTransform::from_se3_params(&params).unwrap();
            assert_relative_eq!(*restored.rotation(), *t.rotation(), epsilon = 1e-12);
            assert_relative_eq!(*restored.translation(), *t.translation(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_transform_points_matches_single_points() {
        let t = sample_transforms()[2];
        let points = Matrix3xX::from_columns(&[
            Vector3::new(0.0, 0.0, 2.0),
            Vector3::new(1.0, -1.0, 0.5),
            Vector3::new(-3.0, 0.2, 10.0),
        ]);
        let batch = t.transform_points(&points);
        for (i, column) in points.column_iter().enumerate() {
            let single = t.transform_point(&column.into_owned());
            assert_relative_eq!(batch.column(i).into_owned(), single, epsilon = 1e-12);
        }
    }
}
