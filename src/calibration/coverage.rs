//! Distribution of accepted corner observations over the image area.
//!
//! Intrinsics are only constrained where corners were observed; a camera
//! solved from views clustered in the image centre extrapolates its
//! distortion badly towards the borders.

use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::calibration::CorrespondenceSet;
use crate::camera::Resolution;

const SPARSE_RATIO: f64 = 0.3;
const MEDIUM_RATIO: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellStatus {
    Empty,
    /// Fewer than 30 % of the busiest cell's observations.
    Sparse,
    /// Fewer than 60 % of the busiest cell's observations.
    Medium,
    Good,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellCoverage {
    pub col: usize,
    pub row: usize,
    pub count: usize,
    pub status: CellStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    pub grid_cols: usize,
    pub grid_rows: usize,
    /// Row-major, `row * grid_cols + col`.
    pub cells: Vec<CellCoverage>,
    pub total_points: usize,
    pub mean_per_cell: f64,
    pub stddev_per_cell: f64,
}

impl CoverageReport {
    pub fn cell(&self, col: usize, row: usize) -> Option<&CellCoverage> {
        if col >= self.grid_cols || row >= self.grid_rows {
            return None;
        }
        self.cells.get(row * self.grid_cols + col)
    }

    pub fn count(&self, status: CellStatus) -> usize {
        self.cells.iter().filter(|c| c.status == status).count()
    }

    /// Fraction of cells holding at least one observation.
    pub fn covered_fraction(&self) -> f64 {
        if self.cells.is_empty() {
            return 0.0;
        }
        (self.cells.len() - self.count(CellStatus::Empty)) as f64 / self.cells.len() as f64
    }

    /// Empty and sparse cells, least observed first.
    pub fn regions_needing_images(&self) -> Vec<CellCoverage> {
        let mut cells: Vec<CellCoverage> = self
            .cells
            .iter()
            .filter(|c| matches!(c.status, CellStatus::Empty | CellStatus::Sparse))
            .copied()
            .collect();
        cells.sort_by_key(|c| (c.count, c.row, c.col));
        cells
    }
}

/// Bins observations into a `grid_cols x grid_rows` grid over the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageAnalyzer {
    pub grid_cols: usize,
    pub grid_rows: usize,
}

impl Default for CoverageAnalyzer {
    fn default() -> Self {
        CoverageAnalyzer {
            grid_cols: 8,
            grid_rows: 6,
        }
    }
}

impl CoverageAnalyzer {
    /// Points outside the image are clamped into the nearest border cell.
    pub fn analyze<'a>(
        &self,
        points: impl IntoIterator<Item = &'a Vector2<f64>>,
        resolution: &Resolution,
    ) -> CoverageReport {
        let cols = self.grid_cols.max(1);
        let rows = self.grid_rows.max(1);
        let cell_w = resolution.width as f64 / cols as f64;
        let cell_h = resolution.height as f64 / rows as f64;

        let mut counts = vec![0usize; cols * rows];
        let mut total_points = 0;
        for p in points {
            let col = ((p.x / cell_w).floor().max(0.0) as usize).min(cols - 1);
            let row = ((p.y / cell_h).floor().max(0.0) as usize).min(rows - 1);
            counts[row * cols + col] += 1;
            total_points += 1;
        }

        let max = counts.iter().copied().max().unwrap_or(0) as f64;
        let cells: Vec<CellCoverage> = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let status = if count == 0 {
                    CellStatus::Empty
                } else if (count as f64) < max * SPARSE_RATIO {
                    CellStatus::Sparse
                } else if (count as f64) < max * MEDIUM_RATIO {
                    CellStatus::Medium
                } else {
                    CellStatus::Good
                };
                CellCoverage {
                    col: i % cols,
                    row: i / cols,
                    count,
                    status,
                }
            })
            .collect();

        let n = cells.len() as f64;
        let mean_per_cell = total_points as f64 / n;
        let stddev_per_cell = (counts
            .iter()
            .map(|&c| (c as f64 - mean_per_cell).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();

        debug!(
            "coverage: {} points over {}x{} cells, mean {:.1} per cell",
            total_points, cols, rows, mean_per_cell
        );

        CoverageReport {
            grid_cols: cols,
            grid_rows: rows,
            cells,
            total_points,
            mean_per_cell,
            stddev_per_cell,
        }
    }

    pub fn analyze_sets(&self, sets: &[CorrespondenceSet], resolution: &Resolution) -> CoverageReport {
        self.analyze(sets.iter().flat_map(|s| s.image_points()), resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const RES: Resolution = Resolution {
        width: 800,
        height: 600,
    };

    #[test]
    fn test_cell_classification() {
        let analyzer = CoverageAnalyzer {
            grid_cols: 2,
            grid_rows: 2,
        };
        let mut points = vec![Vector2::new(100.0, 100.0); 10];
        points.extend(vec![Vector2::new(500.0, 100.0); 5]);
        points.extend(vec![Vector2::new(100.0, 400.0); 2]);

        let report = analyzer.analyze(&points, &RES);
        assert_eq!(report.total_points, 17);
        assert_eq!(report.cell(0, 0).unwrap().status, CellStatus::Good);
        assert_eq!(report.cell(1, 0).unwrap().status, CellStatus::Medium);
        assert_eq!(report.cell(0, 1).unwrap().status, CellStatus::Sparse);
        assert_eq!(report.cell(1, 1).unwrap().status, CellStatus::Empty);
        assert!(report.cell(2, 0).is_none());
        assert_relative_eq!(report.covered_fraction(), 0.75);

        let needing = report.regions_needing_images();
        assert_eq!(needing.len(), 2);
        assert_eq!((needing[0].col, needing[0].row), (1, 1));
    }

    #[test]
    fn test_out_of_image_points_are_clamped() {
        let analyzer = CoverageAnalyzer::default();
        let points = [Vector2::new(-5.0, -5.0), Vector2::new(900.0, 700.0)];
        let report = analyzer.analyze(&points, &RES);
        assert_eq!(report.cell(0, 0).unwrap().count, 1);
        assert_eq!(report.cell(7, 5).unwrap().count, 1);
    }

    #[test]
    fn test_empty_input() {
        let none: Vec<Vector2<f64>> = Vec::new();
        let report = CoverageAnalyzer::default().analyze(&none, &RES);
        assert_eq!(report.cells.len(), 48);
        assert_eq!(report.count(CellStatus::Empty), 48);
        assert_eq!(report.covered_fraction(), 0.0);
    }
}
