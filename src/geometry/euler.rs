//! Roll/pitch/yaw views of rotation matrices.
//!
//! The vehicle convention is [`VEHICLE_EULER_ORDER`]: intrinsic Z-Y-X, i.e.
//! `R = Rz(yaw) * Ry(pitch) * Rx(roll)`. Every Euler conversion in the crate
//! goes through [`EulerAngles::to_matrix`] and [`EulerAngles::from_matrix`]
//! with that order.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

/// Below this, `cos(pitch)` is treated as zero and roll is pinned to 0.
const GIMBAL_LOCK_EPS: f64 = 1e-10;

/// Unit used when angles cross the operator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleUnit {
    #[default]
    Degrees,
    Radians,
}

impl AngleUnit {
    pub fn to_radians(&self, value: f64) -> f64 {
        match self {
            AngleUnit::Degrees => value.to_radians(),
            AngleUnit::Radians => value,
        }
    }
}

/// Order in which roll, pitch and yaw are composed into a rotation matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationOrder {
    /// Yaw about Z, then pitch about the rotated Y, then roll about the
    /// twice-rotated X: `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
    IntrinsicZyx,
    /// Yaw, pitch, roll about the fixed Z, Y, X axes:
    /// `R = Rx(roll) * Ry(pitch) * Rz(yaw)`.
    ExtrinsicZyx,
}

/// The one rotation order used for every vehicle-frame Euler view.
pub const VEHICLE_EULER_ORDER: RotationOrder = RotationOrder::IntrinsicZyx;

/// Roll, pitch and yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl EulerAngles {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        EulerAngles { roll, pitch, yaw }
    }

    pub fn from_degrees(roll: f64, pitch: f64, yaw: f64) -> Self {
        EulerAngles {
            roll: roll.to_radians(),
            pitch: pitch.to_radians(),
            yaw: yaw.to_radians(),
        }
    }

    pub fn from_unit(roll: f64, pitch: f64, yaw: f64, unit: AngleUnit) -> Self {
        EulerAngles {
            roll: unit.to_radians(roll),
            pitch: unit.to_radians(pitch),
            yaw: unit.to_radians(yaw),
        }
    }

    /// `[roll, pitch, yaw]` in degrees.
    pub fn to_degrees(&self) -> [f64; 3] {
        [
            self.roll.to_degrees(),
            self.pitch.to_degrees(),
            self.yaw.to_degrees(),
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.roll.is_finite() && self.pitch.is_finite() && self.yaw.is_finite()
    }

    pub fn to_matrix(&self, order: RotationOrder) -> Matrix3<f64> {
        let rx = rot_x(self.roll);
        let ry = rot_y(self.pitch);
        let rz = rot_z(self.yaw);
        match order {
            RotationOrder::IntrinsicZyx => rz * ry * rx,
            RotationOrder::ExtrinsicZyx => rx * ry * rz,
        }
    }

    /// Recovers the angles of a proper rotation matrix.
    ///
    /// Pitch is returned in `[-pi/2, pi/2]`, roll and yaw in `(-pi, pi]`.
    /// At gimbal lock roll is reported as 0 and the whole in-plane rotation
    /// is assigned to yaw, so `to_matrix(from_matrix(R)) == R` still holds.
    pub fn from_matrix(rotation: &Matrix3<f64>, order: RotationOrder) -> Self {
        match order {
            RotationOrder::IntrinsicZyx => intrinsic_zyx_angles(rotation),
            RotationOrder::ExtrinsicZyx => {
                // Rx(r) Ry(p) Rz(y) = (Rz(-y) Ry(-p) Rx(-r))^T
                let inverse = intrinsic_zyx_angles(&rotation.transpose());
                EulerAngles {
                    roll: -inverse.roll,
                    pitch: -inverse.pitch,
                    yaw: -inverse.yaw,
                }
            }
        }
    }
}

fn intrinsic_zyx_angles(r: &Matrix3<f64>) -> EulerAngles {
    let cos_pitch = (r[(0, 0)] * r[(0, 0)] + r[(1, 0)] * r[(1, 0)]).sqrt();
    let pitch = (-r[(2, 0)]).atan2(cos_pitch);

    if cos_pitch < GIMBAL_LOCK_EPS {
        EulerAngles {
            roll: 0.0,
            pitch,
            yaw: (-r[(0, 1)]).atan2(r[(1, 1)]),
        }
    } else {
        // Roll comes from `Rz(-yaw) * R = Ry(pitch) * Rx(roll)`: its middle
        // row `(0, cos roll, -sin roll)` stays O(1) close to gimbal lock.
        let yaw = r[(1, 0)].atan2(r[(0, 0)]);
        let deyawed = rot_z(-yaw) * r;
        EulerAngles {
            roll: (-deyawed[(1, 2)]).atan2(deyawed[(1, 1)]),
            pitch,
            yaw,
        }
    }
}

pub(crate) fn rot_x(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        1.0, 0.0, 0.0, //
        0.0, c, -s, //
        0.0, s, c,
    )
}

pub(crate) fn rot_y(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        c, 0.0, s, //
        0.0, 1.0, 0.0, //
        -s, 0.0, c,
    )
}

pub(crate) fn rot_z(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        c, -s, 0.0, //
        s, c, 0.0, //
        0.0, 0.0, 1.0,
    )
}
