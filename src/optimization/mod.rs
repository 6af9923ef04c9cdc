//! The `optimization` module provides the non-linear refinement stages of the
//! calibration pipeline.
//!
//! This module defines the [`Optimizer`] trait, which outlines the common interface
//! for the two problems the crate solves with `tiny_solver`:
//!
//! 1. [`PlanarCalibrationCost`]: joint refinement of one shared camera and one
//!    pose per pattern view (intrinsic calibration).
//! 2. [`PoseOptimizationCost`]: refinement of a single pattern pose with the
//!    camera held fixed (perspective-n-point).
//!
//! Both follow the same two steps:
//! 1. A linear estimation step to get an initial guess.
//! 2. A Levenberg-Marquardt step to refine all free parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_solver::optimizer::OptimizerOptions;

pub mod intrinsics;
pub mod pose;
pub(crate) mod residuals;

pub use intrinsics::{PlanarCalibrationCost, PlanarView};
pub use pose::PoseOptimizationCost;

use crate::camera::{Intrinsics, Resolution};
use crate::error::CalibrationError;

/// Summary statistics of per-point pixel reprojection distances.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    /// Computes the statistics of a set of pixel distances.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InsufficientData`] when `errors` is empty.
    pub fn from_errors(errors: &[f64]) -> Result<Self, CalibrationError> {
        if errors.is_empty() {
            return Err(CalibrationError::InsufficientData {
                context: "reprojection statistics".to_string(),
                required: 1,
                actual: 0,
            });
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;

        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
        let rmse = (sum_squared / n).sqrt();

        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted_errors = errors.to_vec();
        sorted_errors.sort_by(|a, b| a.total_cmp(b));
        let median = if sorted_errors.len() % 2 == 0 {
            let mid = sorted_errors.len() / 2;
            (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
        } else {
            sorted_errors[sorted_errors.len() / 2]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev,
            median,
        })
    }
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Levenberg-Marquardt settings shared by every solve.
///
/// Mapped one-to-one onto `tiny_solver`'s [`OptimizerOptions`]; thresholds
/// apply to the solver's cost (half the sum of squared pixel residuals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub verbosity: usize,
    pub min_abs_error_decrease: f64,
    pub min_rel_error_decrease: f64,
    pub min_error: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: 100,
            verbosity: 0,
            min_abs_error_decrease: 1e-12,
            min_rel_error_decrease: 1e-10,
            min_error: 1e-14,
        }
    }
}

impl SolverOptions {
    pub fn to_optimizer_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.max_iterations,
            verbosity_level: self.verbosity,
            min_abs_error_decrease_threshold: self.min_abs_error_decrease,
            min_rel_error_decrease_threshold: self.min_rel_error_decrease,
            min_error_threshold: self.min_error,
            ..OptimizerOptions::default()
        }
    }
}

/// A trait for calibration refinement tasks.
///
/// Types implementing `Optimizer` own their correspondences and the current
/// estimate, and update that estimate in place.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the current estimate.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is reported through `log::info!`.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the optimization converged and the estimate was updated.
    /// * `Err(CalibrationError)` - If the inputs were invalid or the solver
    ///   failed to produce a solution.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Computes a closed-form initial estimate.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the estimate was initialised.
    /// * `Err(CalibrationError)` - If the data is insufficient or degenerate.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    /// Per-point pixel distances between observations and the current model.
    fn reprojection_errors(&self) -> Result<Vec<f64>, CalibrationError>;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    /// Distortion coefficients in the order of the camera's lens model.
    fn get_distortion(&self) -> Vec<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[3.0, 1.0, 4.0, 2.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
    }

    #[test]
    fn test_projection_error_rejects_empty() {
        assert!(matches!(
            ProjectionError::from_errors(&[]),
            Err(CalibrationError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_solver_options_mapping() {
        let options = SolverOptions {
            max_iterations: 42,
            ..SolverOptions::default()
        };
        let mapped = options.to_optimizer_options();
        assert_eq!(mapped.max_iteration, 42);
        assert_eq!(mapped.min_error_threshold, options.min_error);
    }
}
