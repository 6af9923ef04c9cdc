//! Closed-form initialisation for the non-linear solvers.
//!
//! * Hartley-normalised DLT homography between the pattern plane and the image.
//! * Zhang's intrinsics from three or more homographies.
//! * Pattern pose from a homography in normalised image coordinates.

use log::{debug, warn};
use nalgebra::{DMatrix, Matrix3, SVector, Vector2, Vector3};

use crate::camera::{Intrinsics, Resolution};
use crate::error::CalibrationError;
use crate::geometry::transform::RigidTransform;

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to `sqrt(2)`.
fn normalization_transform(points: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply_h(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Right singular vector of the smallest singular value of `a`.
///
/// Rows are zero-padded up to the column count so the null vector is always
/// part of `V^T`.
fn null_vector(a: DMatrix<f64>) -> Option<nalgebra::DVector<f64>> {
    let a = if a.nrows() < a.ncols() {
        let cols = a.ncols();
        a.resize_vertically(cols, 0.0)
    } else {
        a
    };
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(v_t.row(idx).transpose())
}

/// Estimates `H` with `image ~ H * [x, y, 1]` from at least 4 correspondences.
///
/// Both point sets are Hartley-normalised before the DLT; `H` is returned
/// with `H[(2, 2)] = 1` when that entry is not vanishing.
pub fn estimate_homography(
    plane: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CalibrationError> {
    let n = plane.len();
    if n != image.len() {
        return Err(CalibrationError::InvalidInput(format!(
            "homography needs matching point counts, got {} and {}",
            n,
            image.len()
        )));
    }
    if n < 4 {
        return Err(CalibrationError::InsufficientData {
            context: "homography estimation".to_string(),
            required: 4,
            actual: n,
        });
    }

    let degenerate =
        || CalibrationError::InvalidInput("degenerate point configuration for homography".to_string());
    let t_plane = normalization_transform(plane).ok_or_else(degenerate)?;
    let t_image = normalization_transform(image).ok_or_else(degenerate)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in plane.iter().zip(image.iter()).enumerate() {
        let w = apply_h(&t_plane, pw);
        let m = apply_h(&t_image, pi);
        let (x, y, u, v) = (w.x, w.y, m.x, m.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = null_vector(a).ok_or_else(degenerate)?;
    let h_norm = Matrix3::from_row_slice(h.as_slice());

    let t_image_inv = t_image.try_inverse().ok_or_else(degenerate)?;
    let mut h_mat = t_image_inv * h_norm * t_plane;

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    if !h_mat.iter().all(|v| v.is_finite()) {
        return Err(degenerate());
    }
    Ok(h_mat)
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);

    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Pixel scaling applied before the closed-form solve.
fn size_normalization(resolution: &Resolution) -> (f64, Matrix3<f64>) {
    let s = resolution.width.max(resolution.height).max(1) as f64;
    (s, Matrix3::new(1.0 / s, 0.0, 0.0, 0.0, 1.0 / s, 0.0, 0.0, 0.0, 1.0))
}

fn zhang_closed_form(homographies: &[Matrix3<f64>]) -> Option<Intrinsics> {
    let m = homographies.len();
    // Two constraints per view plus a zero-skew row.
    let mut v = DMatrix::<f64>::zeros(2 * m + 1, 6);
    for (k, h) in homographies.iter().enumerate() {
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        let v12 = v_ij(h, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }
    v[(2 * m, 1)] = 1.0;

    let mut b = null_vector(v)?;
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let denom_norm = b11 * b11 + b22 * b22;
    if denom_norm <= 0.0 || denom.abs() / denom_norm < 1e-6 {
        return None;
    }

    let cy = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + cy * (b12 * b13 - b11 * b23)) / b11;
    if lambda.signum() != b11.signum() {
        return None;
    }
    let fx = (lambda / b11).sqrt();
    let fy = (lambda * b11 / denom).sqrt();
    let skew = -b12 * fx * fx * fy / lambda;
    let cx = skew * cy / fy - b13 * fx * fx / lambda;

    let intrinsics = Intrinsics { fx, fy, cx, cy };
    if [fx, fy, cx, cy].iter().all(|v| v.is_finite()) && fx > 0.0 && fy > 0.0 {
        Some(intrinsics)
    } else {
        None
    }
}

/// Focal lengths with the principal point pinned to the origin of the
/// (already centred) homographies.
fn centered_focal_lengths(homographies: &[Matrix3<f64>]) -> Option<(f64, f64)> {
    // Unknowns a = 1/fx^2, b = 1/fy^2; each view gives two linear equations.
    let mut ata = nalgebra::Matrix2::<f64>::zeros();
    let mut atb = Vector2::<f64>::zeros();
    for h in homographies {
        let rows = [
            (
                Vector2::new(h[(0, 0)] * h[(0, 1)], h[(1, 0)] * h[(1, 1)]),
                -h[(2, 0)] * h[(2, 1)],
            ),
            (
                Vector2::new(
                    h[(0, 0)] * h[(0, 0)] - h[(0, 1)] * h[(0, 1)],
                    h[(1, 0)] * h[(1, 0)] - h[(1, 1)] * h[(1, 1)],
                ),
                -(h[(2, 0)] * h[(2, 0)] - h[(2, 1)] * h[(2, 1)]),
            ),
        ];
        for (row, rhs) in rows.iter() {
            ata += row * row.transpose();
            atb += row * *rhs;
        }
    }

    if let Some(sol) = ata.try_inverse().map(|inv| inv * atb) {
        if sol.x > 0.0 && sol.y > 0.0 {
            return Some((1.0 / sol.x.sqrt(), 1.0 / sol.y.sqrt()));
        }
    }

    // Shared focal length: a single unknown.
    let a = ata.sum();
    let rhs = atb.sum();
    if a > 0.0 && rhs / a > 0.0 {
        let f = 1.0 / (rhs / a).sqrt();
        return Some((f, f));
    }
    None
}

/// Initial pinhole intrinsics from pattern-plane homographies.
///
/// Homographies map pattern `(x, y)` to raw pixels. Zhang's closed form runs
/// on size-normalised pixels. When it is degenerate (too few distinct
/// orientations, nearly fronto-parallel views) the principal point is pinned
/// to the image centre and only the focal lengths are solved; as a last
/// resort the focal length defaults to the larger image dimension.
pub fn initial_intrinsics(
    homographies: &[Matrix3<f64>],
    resolution: &Resolution,
) -> Result<Intrinsics, CalibrationError> {
    if homographies.len() < 3 {
        return Err(CalibrationError::InsufficientData {
            context: "closed-form intrinsics".to_string(),
            required: 3,
            actual: homographies.len(),
        });
    }

    let (s, n) = size_normalization(resolution);
    let scaled: Vec<Matrix3<f64>> = homographies.iter().map(|h| n * h).collect();

    if let Some(k) = zhang_closed_form(&scaled) {
        let intrinsics = Intrinsics {
            fx: k.fx * s,
            fy: k.fy * s,
            cx: k.cx * s,
            cy: k.cy * s,
        };
        let inside = intrinsics.cx > 0.0
            && intrinsics.cx < resolution.width as f64
            && intrinsics.cy > 0.0
            && intrinsics.cy < resolution.height as f64;
        if inside {
            debug!("closed-form intrinsics: {:?}", intrinsics);
            return Ok(intrinsics);
        }
        debug!(
            "closed-form principal point ({:.1}, {:.1}) is outside the image",
            intrinsics.cx, intrinsics.cy
        );
    }

    let cx = resolution.width as f64 / 2.0;
    let cy = resolution.height as f64 / 2.0;
    let center = Matrix3::new(1.0, 0.0, -cx / s, 0.0, 1.0, -cy / s, 0.0, 0.0, 1.0);
    let centered: Vec<Matrix3<f64>> = scaled.iter().map(|h| center * h).collect();

    let (fx, fy) = match centered_focal_lengths(&centered) {
        Some((fx, fy)) => (fx * s, fy * s),
        None => {
            warn!("focal length initialisation is degenerate, defaulting to image size");
            (s, s)
        }
    };
    warn!(
        "closed-form intrinsics degenerate; using centred principal point, fx={:.1} fy={:.1}",
        fx, fy
    );
    Ok(Intrinsics { fx, fy, cx, cy })
}

/// Pose of the pattern plane (`z = 0`) in the camera frame.
///
/// `h` maps pattern `(x, y)` to normalised image coordinates (`K^-1` already
/// applied). The rotation is projected onto SO(3) and the sign of the scale
/// is chosen so the pattern lies in front of the camera.
pub fn pose_from_homography(h: &Matrix3<f64>) -> Result<RigidTransform, CalibrationError> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = (h1.norm() + h2.norm()) * 0.5;
    if norm <= f64::EPSILON {
        return Err(CalibrationError::InvalidInput(
            "homography has vanishing rotation columns".to_string(),
        ));
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(CalibrationError::InvalidInput(
                "SVD failed while orthonormalising pose".to_string(),
            ))
        }
    };
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        rotation = u_flipped * v_t;
    }

    Ok(RigidTransform::from_parts_unchecked(rotation, h3 * lambda))
}
