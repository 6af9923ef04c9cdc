//! Frame algebra shared by every calibration stage: rigid transforms, Euler
//! views, declared axis remaps and the closed-form planar initialisers.

pub mod axis_remap;
pub mod euler;
pub mod homography;
pub mod transform;

pub use axis_remap::AxisRemap;
pub use euler::{AngleUnit, EulerAngles, RotationOrder, VEHICLE_EULER_ORDER};
pub use homography::{estimate_homography, initial_intrinsics, pose_from_homography};
pub use transform::{RigidTransform, ORTHONORMAL_TOLERANCE};
