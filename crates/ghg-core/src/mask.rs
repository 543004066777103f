//! Territory mask: which grid cells belong to the reporting country.

use crate::grid::{Grid, GridError};
use crate::raster::Raster;

#[derive(Debug, Clone, PartialEq)]
pub struct TerritoryMask {
    grid: Grid,
    inside: Vec<bool>,
}

impl TerritoryMask {
    /// Every cell of the grid is in-territory.
    pub fn full(grid: Grid) -> Self {
        Self { grid, inside: vec![true; grid.len()] }
    }

    /// In-territory where the mask raster is valid and strictly positive.
    pub fn from_raster(mask: &Raster) -> Self {
        let inside = (0..mask.len()).map(|i| mask.value(i).is_some_and(|v| v > 0.0)).collect();
        Self { grid: *mask.grid(), inside }
    }

    /// In-territory where the cell centre lies inside the polygon ring
    /// (even-odd rule). Vertices are `[lon, lat]`; the ring may be open or
    /// closed.
    pub fn from_polygon(grid: Grid, ring: &[[f64; 2]]) -> Self {
        let mut inside = vec![false; grid.len()];
        if ring.len() >= 3 {
            for r in 0..grid.height() {
                for c in 0..grid.width() {
                    let (lat, lon) = grid.cell_center(r, c);
                    inside[grid.index(r, c)] = point_in_ring(lon, lat, ring);
                }
            }
        }
        Self { grid, inside }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.inside[index]
    }

    /// Indices of in-territory cells in ascending order.
    pub fn cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.inside.iter().enumerate().filter_map(|(i, &b)| b.then_some(i))
    }

    pub fn count(&self) -> usize {
        self.inside.iter().filter(|&&b| b).count()
    }

    pub fn ensure_aligned(&self, grid: &Grid) -> Result<(), GridError> {
        self.grid.ensure_aligned(grid)
    }
}

/// Ray-casting point-in-polygon test.
fn point_in_ring(x: f64, y: f64, ring: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let n = ring.len();
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
