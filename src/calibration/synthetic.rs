//! Deterministic planar-target observations from a known camera.
//!
//! Used by the tests and the demo in place of a capture + detection pipeline.
//! Pixel jitter comes from an integer splitmix64 hash of the image id and the
//! corner index, so every run on every platform sees the same data.

use nalgebra::{Vector2, Vector3};

use crate::calibration::{CorrespondenceSet, PatternGeometry};
use crate::camera::{CameraIntrinsics, CameraModel};
use crate::error::CalibrationError;
use crate::geometry::{EulerAngles, RigidTransform, VEHICLE_EULER_ORDER};

/// `(roll, pitch, yaw)` in degrees and the board-centre offset from the
/// optical axis as a fraction of the viewing distance.
const VIEW_TABLE: [(f64, f64, f64, f64, f64); 8] = [
    (20.0, -10.0, 5.0, -0.10, -0.05),
    (-15.0, 25.0, -8.0, 0.10, 0.05),
    (5.0, -30.0, 12.0, 0.00, 0.10),
    (-25.0, 5.0, 0.0, -0.10, 0.10),
    (10.0, 15.0, -15.0, 0.10, -0.10),
    (30.0, 0.0, 3.0, 0.00, -0.05),
    (0.0, -20.0, -5.0, 0.12, 0.00),
    (-10.0, -10.0, 20.0, -0.12, 0.00),
];

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Stream key of one image.
fn image_seed(image_id: &str) -> u64 {
    image_id
        .bytes()
        .fold(0, |h, b| splitmix64(h ^ u64::from(b)))
}

/// Uniform value in `[-1, 1)` derived from `key`.
fn unit_jitter(key: u64) -> f64 {
    // Top 53 bits as a double in [0, 1).
    let u = (splitmix64(key) >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
    u * 2.0 - 1.0
}

/// Per-axis jitter of corner `index` in the image with stream key `seed`.
fn corner_jitter(seed: u64, index: usize) -> Vector2<f64> {
    let key = seed ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    Vector2::new(unit_jitter(key), unit_jitter(key ^ 0x94D0_49BB_1331_11EB))
}

/// Pattern-to-camera poses looking at the board centre from
/// `distance` metres, cycling through a fixed table of tilts.
///
/// # Errors
///
/// [`CalibrationError::InvalidInput`] for an invalid pattern.
pub fn view_poses(
    pattern: &PatternGeometry,
    distance: f64,
    count: usize,
) -> Result<Vec<RigidTransform>, CalibrationError> {
    pattern.validate()?;
    let centre = Vector3::new(
        (pattern.cols - 1) as f64 * pattern.square_size / 2.0,
        (pattern.rows - 1) as f64 * pattern.square_size / 2.0,
        0.0,
    );
    Ok((0..count)
        .map(|i| {
            let (roll, pitch, yaw, ox, oy) = VIEW_TABLE[i % VIEW_TABLE.len()];
            // Repeated entries are pushed slightly further back.
            let depth = distance * (1.0 + 0.1 * (i / VIEW_TABLE.len()) as f64);
            let rotation = EulerAngles::from_degrees(roll, pitch, yaw).to_matrix(VEHICLE_EULER_ORDER);
            let target = Vector3::new(ox * depth, oy * depth, depth);
            RigidTransform::from_parts_unchecked(rotation, target - rotation * centre)
        })
        .collect())
}

/// Projects the pattern through `camera` at `pattern_to_camera`, adding up to
/// `jitter_px` of deterministic noise per axis.
///
/// # Errors
///
/// Propagates projection failures (corners behind the camera).
pub fn observe(
    image_id: &str,
    camera: &CameraIntrinsics,
    pattern: &PatternGeometry,
    pattern_to_camera: &RigidTransform,
    jitter_px: f64,
) -> Result<CorrespondenceSet, CalibrationError> {
    let seed = image_seed(image_id);
    let object_points = pattern.object_points();
    let image_points = object_points
        .iter()
        .enumerate()
        .map(|(k, p)| {
            let pixel = camera.project(&pattern_to_camera.transform_point(p))?;
            Ok(pixel + jitter_px * corner_jitter(seed, k))
        })
        .collect::<Result<Vec<_>, CalibrationError>>()?;
    CorrespondenceSet::new(image_id, object_points, image_points)
}

/// `count` observations named `view_000`, `view_001`, ...
pub fn calibration_views(
    camera: &CameraIntrinsics,
    pattern: &PatternGeometry,
    distance: f64,
    count: usize,
    jitter_px: f64,
) -> Result<Vec<CorrespondenceSet>, CalibrationError> {
    view_poses(pattern, distance, count)?
        .iter()
        .enumerate()
        .map(|(i, pose)| observe(&format!("view_{:03}", i), camera, pattern, pose, jitter_px))
        .collect()
}
