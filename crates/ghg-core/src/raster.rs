//! Value-per-cell rasters over a shared [`Grid`].
//!
//! Rasters are value objects: every combining operation returns a new raster
//! and leaves its inputs untouched. A cell equal to the raster's no-data
//! sentinel (or non-finite) is *invalid* and is skipped by sums and
//! propagated by binary operations.

use serde::{Deserialize, Serialize};

use crate::grid::{Grid, GridError};
use crate::mask::TerritoryMask;

/// No-data sentinel used by freshly created rasters and exports.
pub const DEFAULT_NODATA: f64 = -9999.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RasterRepr")]
pub struct Raster {
    grid: Grid,
    /// Row-major, row 0 = south.
    data: Vec<f64>,
    nodata: f64,
}

#[derive(Deserialize)]
struct RasterRepr {
    grid: Grid,
    data: Vec<f64>,
    #[serde(default = "default_nodata")]
    nodata: f64,
}

fn default_nodata() -> f64 {
    DEFAULT_NODATA
}

impl TryFrom<RasterRepr> for Raster {
    type Error = GridError;

    fn try_from(r: RasterRepr) -> Result<Self, Self::Error> {
        Raster::new(r.grid, r.data, r.nodata)
    }
}

impl Raster {
    pub fn new(grid: Grid, data: Vec<f64>, nodata: f64) -> Result<Self, GridError> {
        if data.len() != grid.len() {
            return Err(GridError::LengthMismatch { expected: grid.len(), found: data.len() });
        }
        Ok(Self { grid, data, nodata })
    }

    /// A raster with every cell set to `value`.
    pub fn filled(grid: Grid, value: f64) -> Self {
        Self { grid, data: vec![value; grid.len()], nodata: DEFAULT_NODATA }
    }

    pub fn zeros(grid: Grid) -> Self {
        Self::filled(grid, 0.0)
    }

    /// Build from a per-cell function of `(row, col)`.
    pub fn from_fn(grid: Grid, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(grid.len());
        for r in 0..grid.height() {
            for c in 0..grid.width() {
                data.push(f(r, c));
            }
        }
        Self { grid, data, nodata: DEFAULT_NODATA }
    }

    #[inline]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        let v = self.data[index];
        v.is_finite() && v != self.nodata
    }

    /// Cell value, or None for an invalid cell.
    #[inline]
    pub fn value(&self, index: usize) -> Option<f64> {
        self.is_valid(index).then(|| self.data[index])
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.value(self.grid.index(row, col))
    }

    /// Nearest-cell value at a geographic point.
    pub fn sample(&self, lat: f64, lon: f64) -> Option<f64> {
        self.grid.cell_at(lat, lon).and_then(|i| self.value(i))
    }

    pub fn valid_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_valid(i)).count()
    }

    pub fn ensure_aligned(&self, other: &Raster) -> Result<(), GridError> {
        self.grid.ensure_aligned(&other.grid)
    }

    /// Compensated sum over valid cells.
    pub fn sum(&self) -> f64 {
        compensated_sum((0..self.len()).filter_map(|i| self.value(i)))
    }

    /// Compensated sum over valid cells inside the territory.
    pub fn sum_within(&self, territory: &TerritoryMask) -> Result<f64, GridError> {
        self.grid.ensure_aligned(territory.grid())?;
        Ok(compensated_sum(territory.cells().filter_map(|i| self.value(i))))
    }

    /// Apply `f` to every valid cell; invalid cells stay invalid.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Raster {
        let data = (0..self.len())
            .map(|i| match self.value(i) {
                Some(v) => f(v),
                None => self.nodata,
            })
            .collect();
        Raster { grid: self.grid, data, nodata: self.nodata }
    }

    pub fn scaled(&self, k: f64) -> Raster {
        self.map(|v| v * k)
    }

    /// Valid values below zero become zero.
    pub fn clipped_non_negative(&self) -> Raster {
        self.map(|v| v.max(0.0))
    }

    /// `1 − v`, floored at zero. Meant for indicators already in [0, 1].
    pub fn complement(&self) -> Raster {
        self.map(|v| (1.0 - v).max(0.0))
    }

    /// Replace every invalid cell with `value`. When `value` collides with
    /// the sentinel, the result's sentinel becomes NaN so every cell stays valid.
    pub fn filled_nodata(&self, value: f64) -> Raster {
        let data = (0..self.len()).map(|i| self.value(i).unwrap_or(value)).collect();
        let nodata = if value == self.nodata { f64::NAN } else { self.nodata };
        Raster { grid: self.grid, data, nodata }
    }

    /// Cell-wise sum. A cell invalid in either input is invalid in the output.
    pub fn add(&self, other: &Raster) -> Result<Raster, GridError> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Cell-wise product with the same no-data propagation as [`Raster::add`].
    pub fn multiply(&self, other: &Raster) -> Result<Raster, GridError> {
        self.zip_with(other, |a, b| a * b)
    }

    fn zip_with(&self, other: &Raster, f: impl Fn(f64, f64) -> f64) -> Result<Raster, GridError> {
        self.ensure_aligned(other)?;
        let data = (0..self.len())
            .map(|i| match (self.value(i), other.value(i)) {
                (Some(a), Some(b)) => f(a, b),
                _ => self.nodata,
            })
            .collect();
        Ok(Raster { grid: self.grid, data, nodata: self.nodata })
    }

    /// Set every cell outside the territory to no-data.
    pub fn masked(&self, territory: &TerritoryMask) -> Result<Raster, GridError> {
        self.grid.ensure_aligned(territory.grid())?;
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &v)| if territory.contains(i) { v } else { self.nodata })
            .collect();
        Ok(Raster { grid: self.grid, data, nodata: self.nodata })
    }

    /// Robust min–max scaling onto [0, 1].
    ///
    /// The `q_lo` and `q_hi` percentiles (fractions in [0, 1]) of the valid
    /// cells become 0 and 1; values beyond them are clamped. A flat raster
    /// (equal percentiles) maps every valid cell to 0.
    pub fn unit_scaled(&self, q_lo: f64, q_hi: f64) -> Raster {
        let mut valid: Vec<f64> = (0..self.len()).filter_map(|i| self.value(i)).collect();
        if valid.is_empty() {
            return self.clone();
        }
        valid.sort_by(f64::total_cmp);
        let lo = percentile_sorted(&valid, q_lo);
        let hi = percentile_sorted(&valid, q_hi);
        let span = hi - lo;
        if span <= 0.0 {
            return self.map(|_| 0.0);
        }
        self.map(|v| ((v - lo) / span).clamp(0.0, 1.0))
    }
}

/// Linear-interpolated percentile of an ascending slice; `q` in [0, 1].
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f64;
    sorted[lo] * (1.0 - t) + sorted[hi] * t
}

/// Neumaier-compensated summation.
pub(crate) fn compensated_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0f64;
    let mut c = 0.0f64;
    for v in values {
        let t = sum + v;
        if sum.abs() >= v.abs() {
            c += (sum - t) + v;
        } else {
            c += (v - t) + sum;
        }
        sum = t;
    }
    sum + c
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_2x2() -> Grid {
        Grid::new(0.0, 0.0, 2.0, 2.0, 1.0).unwrap()
    }

    #[test]
    fn new_rejects_wrong_length() {
        let err = Raster::new(grid_2x2(), vec![1.0; 3], DEFAULT_NODATA).unwrap_err();
        assert_eq!(err, GridError::LengthMismatch { expected: 4, found: 3 });
    }

    #[test]
    fn sum_skips_nodata_and_nan() {
        let r = Raster::new(grid_2x2(), vec![1.0, DEFAULT_NODATA, f64::NAN, 2.5], DEFAULT_NODATA).unwrap();
        assert_eq!(r.valid_count(), 2);
        assert_relative_eq!(r.sum(), 3.5);
        assert_eq!(r.value(1), None);
    }

    #[test]
    fn operations_do_not_mutate_inputs() {
        let a = Raster::filled(grid_2x2(), 2.0);
        let b = Raster::filled(grid_2x2(), 3.0);
        let c = a.add(&b).unwrap();
        let d = a.scaled(10.0);
        assert_eq!(a.data(), &[2.0; 4]);
        assert_eq!(b.data(), &[3.0; 4]);
        assert_eq!(c.data(), &[5.0; 4]);
        assert_eq!(d.data(), &[20.0; 4]);
    }

    #[test]
    fn binary_ops_propagate_nodata() {
        let a = Raster::new(grid_2x2(), vec![1.0, DEFAULT_NODATA, 1.0, 1.0], DEFAULT_NODATA).unwrap();
        let b = Raster::filled(grid_2x2(), 4.0);
        let p = a.multiply(&b).unwrap();
        assert_eq!(p.value(0), Some(4.0));
        assert_eq!(p.value(1), None);
    }

    #[test]
    fn misaligned_rasters_are_rejected() {
        let a = Raster::zeros(grid_2x2());
        let b = Raster::zeros(Grid::new(0.0, 0.0, 2.0, 2.0, 0.5).unwrap());
        assert!(matches!(a.add(&b), Err(GridError::Misaligned { .. })));
    }

    #[test]
    fn complement_floors_at_zero() {
        let r = Raster::new(grid_2x2(), vec![0.0, 0.25, 1.0, 1.5], DEFAULT_NODATA).unwrap();
        assert_eq!(r.complement().data(), &[1.0, 0.75, 0.0, 0.0]);
    }

    #[test]
    fn filled_nodata_leaves_no_invalid_cells() {
        let r = Raster::new(grid_2x2(), vec![f64::NAN, -1.0, DEFAULT_NODATA, 2.0], DEFAULT_NODATA).unwrap();
        let f = r.filled_nodata(0.0);
        assert_eq!(f.data(), &[0.0, -1.0, 0.0, 2.0]);
        assert_eq!(f.valid_count(), 4);
        assert_eq!(f.clipped_non_negative().data(), &[0.0, 0.0, 0.0, 2.0]);

        // Filling with a value equal to the sentinel keeps the cells valid.
        let zero_sentinel = Raster::new(grid_2x2(), vec![0.0, 1.0, 0.0, 1.0], 0.0).unwrap();
        assert_eq!(zero_sentinel.valid_count(), 2);
        assert_eq!(zero_sentinel.filled_nodata(0.0).valid_count(), 4);
    }

    #[test]
    fn unit_scaled_clamps_outliers() {
        let g = Grid::new(0.0, 0.0, 5.0, 1.0, 1.0).unwrap();
        let r = Raster::new(g, vec![0.0, 1.0, 2.0, 3.0, 400.0], DEFAULT_NODATA).unwrap();
        let s = r.unit_scaled(0.0, 0.75);
        assert_relative_eq!(s.data()[0], 0.0);
        assert_relative_eq!(s.data()[3], 1.0);
        assert_relative_eq!(s.data()[4], 1.0);
        assert!(s.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn compensated_sum_beats_naive_drift() {
        let values = std::iter::once(1e16).chain(std::iter::repeat(1.0).take(1000));
        assert_eq!(compensated_sum(values), 1e16 + 1000.0);
    }

    #[test]
    fn json_round_trip_validates_length() {
        let r = Raster::filled(grid_2x2(), 0.5);
        let json = serde_json::to_string(&r).unwrap();
        let back: Raster = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);

        let bad = json.replace("[0.5,0.5,0.5,0.5]", "[0.5]");
        assert!(serde_json::from_str::<Raster>(&bad).is_err());
    }
}
