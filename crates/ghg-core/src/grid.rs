use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative slack used when comparing grid bounds (fraction of one cell).
const ALIGN_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GridError {
    #[error("invalid cell size {0}: must be finite and > 0")]
    InvalidCellSize(f64),
    #[error("invalid extent lon [{min_lon}, {max_lon}] lat [{min_lat}, {max_lat}]")]
    InvalidExtent {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
    #[error("grid of {width}×{height} cells is too large")]
    TooLarge { width: usize, height: usize },
    #[error("raster has {found} cells but grid has {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("grid mismatch: expected {expected}, found {found}")]
    Misaligned { expected: Grid, found: Grid },
}

/// The serialized form of a grid: extent plus cell size.
/// Width and height are always derived, never read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
    pub cell_size_deg: f64,
}

/// A regular lon/lat lattice shared by every raster of a run.
///
/// Row 0 is the southernmost row (min_lat), column 0 the westernmost.
/// Cell `(row, col)` has index `row * width + col`.
///
/// Width and height are `floor(extent / cell_size)`, so a trailing partial
/// cell is dropped and the effective east/north edges are
/// `min + n * cell_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GridSpec", into = "GridSpec")]
pub struct Grid {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
    cell_size_deg: f64,
    width: usize,
    height: usize,
}

impl Grid {
    pub fn new(
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
        cell_size_deg: f64,
    ) -> Result<Self, GridError> {
        if !cell_size_deg.is_finite() || cell_size_deg <= 0.0 {
            return Err(GridError::InvalidCellSize(cell_size_deg));
        }
        let extent_ok = [min_lon, min_lat, max_lon, max_lat].iter().all(|v| v.is_finite())
            && max_lon > min_lon
            && max_lat > min_lat;
        let bad_extent = GridError::InvalidExtent { min_lon, min_lat, max_lon, max_lat };
        if !extent_ok {
            return Err(bad_extent);
        }

        // Slack absorbs decimal-degree noise, e.g. (73.2 - 55.9) / 0.01 = 1729.999…
        let width = ((max_lon - min_lon) / cell_size_deg + 1e-6).floor() as usize;
        let height = ((max_lat - min_lat) / cell_size_deg + 1e-6).floor() as usize;
        if width == 0 || height == 0 {
            return Err(bad_extent);
        }
        // `as usize` saturates, so absurd extents surface here.
        if width.checked_mul(height).is_none() {
            return Err(GridError::TooLarge { width, height });
        }

        Ok(Self { min_lon, min_lat, max_lon, max_lat, cell_size_deg, width, height })
    }

    pub fn spec(&self) -> GridSpec {
        GridSpec {
            min_lon: self.min_lon,
            min_lat: self.min_lat,
            max_lon: self.max_lon,
            max_lat: self.max_lat,
            cell_size_deg: self.cell_size_deg,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Total number of cells, `width × height`.
    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    /// Always false for a constructed grid; present for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min_lon(&self) -> f64 {
        self.min_lon
    }

    pub fn min_lat(&self) -> f64 {
        self.min_lat
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size_deg
    }

    /// Eastern edge actually covered by whole cells.
    pub fn effective_max_lon(&self) -> f64 {
        self.min_lon + self.width as f64 * self.cell_size_deg
    }

    /// Northern edge actually covered by whole cells.
    pub fn effective_max_lat(&self) -> f64 {
        self.min_lat + self.height as f64 * self.cell_size_deg
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    #[inline]
    pub fn row_col(&self, index: usize) -> (usize, usize) {
        (index / self.width, index % self.width)
    }

    /// Centre of a cell as `(lat, lon)`.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lat = self.min_lat + (row as f64 + 0.5) * self.cell_size_deg;
        let lon = self.min_lon + (col as f64 + 0.5) * self.cell_size_deg;
        (lat, lon)
    }

    /// Index of the cell containing `(lat, lon)`, which is also the cell with
    /// the nearest centre. Points on the outer east/north edge map to the last
    /// column/row. Returns None outside the covered extent.
    pub fn cell_at(&self, lat: f64, lon: f64) -> Option<usize> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if lon < self.min_lon
            || lon > self.effective_max_lon()
            || lat < self.min_lat
            || lat > self.effective_max_lat()
        {
            return None;
        }
        let col = (((lon - self.min_lon) / self.cell_size_deg).floor() as usize).min(self.width - 1);
        let row = (((lat - self.min_lat) / self.cell_size_deg).floor() as usize).min(self.height - 1);
        Some(self.index(row, col))
    }

    /// True when both grids describe the same lattice.
    pub fn is_aligned(&self, other: &Grid) -> bool {
        let eps = self.cell_size_deg * ALIGN_EPS;
        self.width == other.width
            && self.height == other.height
            && (self.min_lon - other.min_lon).abs() <= eps
            && (self.min_lat - other.min_lat).abs() <= eps
            && (self.cell_size_deg - other.cell_size_deg).abs() <= eps
    }

    pub fn ensure_aligned(&self, other: &Grid) -> Result<(), GridError> {
        if self.is_aligned(other) {
            Ok(())
        } else {
            Err(GridError::Misaligned { expected: *self, found: *other })
        }
    }
}

impl TryFrom<GridSpec> for Grid {
    type Error = GridError;

    fn try_from(s: GridSpec) -> Result<Self, Self::Error> {
        Grid::new(s.min_lon, s.min_lat, s.max_lon, s.max_lat, s.cell_size_deg)
    }
}

impl From<Grid> for GridSpec {
    fn from(g: Grid) -> Self {
        g.spec()
    }
}

impl std::fmt::Display for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}×{} @ {}° from ({}, {})",
            self.width, self.height, self.cell_size_deg, self.min_lon, self.min_lat
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_absorb_decimal_noise() {
        // Reference national extent at 0.01°.
        let g = Grid::new(55.9, 37.2, 73.2, 45.6, 0.01).unwrap();
        assert_eq!(g.width(), 1730);
        assert_eq!(g.height(), 840);
        assert_eq!(g.len(), 1730 * 840);
    }

    #[test]
    fn partial_trailing_cell_is_dropped() {
        let g = Grid::new(0.0, 0.0, 2.5, 1.0, 1.0).unwrap();
        assert_eq!(g.width(), 2);
        assert_eq!(g.height(), 1);
        assert!((g.effective_max_lon() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_degenerate_definitions() {
        assert!(matches!(Grid::new(0.0, 0.0, 1.0, 1.0, 0.0), Err(GridError::InvalidCellSize(_))));
        assert!(matches!(Grid::new(1.0, 0.0, 0.0, 1.0, 0.1), Err(GridError::InvalidExtent { .. })));
        assert!(matches!(Grid::new(0.0, 0.0, 0.5, 1.0, 1.0), Err(GridError::InvalidExtent { .. })));
    }

    #[test]
    fn overflowing_cell_count_is_rejected() {
        let err = Grid::new(-1e12, -1e12, 1e12, 1e12, 1e-9).unwrap_err();
        assert!(matches!(err, GridError::TooLarge { .. }));
    }

    #[test]
    fn cell_at_uses_south_up_rows() {
        let g = Grid::new(10.0, 20.0, 14.0, 22.0, 1.0).unwrap();
        // South-west corner cell.
        assert_eq!(g.cell_at(20.1, 10.1), Some(0));
        // North-east corner, on the outer edge.
        assert_eq!(g.cell_at(22.0, 14.0), Some(g.index(1, 3)));
        assert_eq!(g.cell_at(21.5, 12.5), Some(g.index(1, 2)));
        assert_eq!(g.cell_at(19.9, 12.0), None);
        assert_eq!(g.cell_at(21.0, 14.1), None);
    }

    #[test]
    fn cell_center_round_trips_through_cell_at() {
        let g = Grid::new(55.9, 37.2, 56.9, 38.2, 0.1).unwrap();
        for idx in 0..g.len() {
            let (r, c) = g.row_col(idx);
            let (lat, lon) = g.cell_center(r, c);
            assert_eq!(g.cell_at(lat, lon), Some(idx));
        }
    }

    #[test]
    fn alignment_detects_offset_grids() {
        let a = Grid::new(0.0, 0.0, 4.0, 4.0, 1.0).unwrap();
        let b = Grid::new(0.5, 0.0, 4.5, 4.0, 1.0).unwrap();
        assert!(a.ensure_aligned(&a).is_ok());
        assert!(matches!(a.ensure_aligned(&b), Err(GridError::Misaligned { .. })));
    }

    #[test]
    fn serde_derives_dimensions() {
        let json = r#"{"min_lon":0.0,"min_lat":0.0,"max_lon":3.0,"max_lat":2.0,"cell_size_deg":0.5}"#;
        let g: Grid = serde_json::from_str(json).unwrap();
        assert_eq!((g.width(), g.height()), (6, 4));
        let bad = r#"{"min_lon":0.0,"min_lat":0.0,"max_lon":3.0,"max_lat":2.0,"cell_size_deg":-1.0}"#;
        assert!(serde_json::from_str::<Grid>(bad).is_err());
    }
}
