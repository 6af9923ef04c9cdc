//! Vehicle Camera Calibration Library
//!
//! Intrinsic and camera-to-vehicle extrinsic calibration for cameras mounted
//! on a vehicle. The library covers:
//! - Lens models: radial-tangential for standard lenses and Kannala-Brandt for
//!   wide-angle/fisheye lenses
//! - Intrinsic calibration from planar pattern views (closed-form start, then
//!   joint Levenberg-Marquardt refinement with tiny-solver)
//! - Perspective-n-point for a planar pattern and a calibrated camera
//! - Camera-to-vehicle extrinsics from a manual measurement, a pattern with a
//!   known vehicle-frame placement, or a persisted transform
//! - Point transfer from the camera frame to the vehicle frame
//!
//! Corner detection, image capture and visualisation are left to the caller;
//! the library consumes ordered 2D corner lists matched to a known grid.

pub mod calibration;
pub mod camera;
pub mod error;
pub mod geometry;
pub mod optimization;
pub mod persistence;

// Re-export commonly used types
pub use calibration::{
    CalibrationResult, CorrespondenceSet, ExtrinsicConfig, ExtrinsicEngine, ExtrinsicResult,
    IntrinsicAccumulator, IntrinsicConfig, IntrinsicResult, PatternGeometry, PatternPlacement,
    PointTransformer, PoseSolver, PoseSolverConfig,
};
pub use camera::{CameraIntrinsics, CameraModel, CameraModelError, Intrinsics, LensModel, Resolution};
pub use error::CalibrationError;
pub use geometry::{AngleUnit, AxisRemap, EulerAngles, RigidTransform, RotationOrder, VEHICLE_EULER_ORDER};
pub use optimization::{Optimizer, ProjectionError, SolverOptions};
pub use persistence::{load_document, save_document, ExtrinsicDocument, IntrinsicDocument};
