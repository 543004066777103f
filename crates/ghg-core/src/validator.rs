//! Point sampling of output rasters for sanity checks.
//!
//! Read-only; nothing in the pipeline depends on the sampled values.

use serde::{Deserialize, Serialize};

use crate::mask::TerritoryMask;
use crate::raster::Raster;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl SamplePoint {
    pub fn new(name: &str, lat: f64, lon: f64) -> Self {
        Self { name: name.to_string(), lat, lon }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleValue {
    pub point: String,
    pub lat: f64,
    pub lon: f64,
    /// Gas code or "combined".
    pub layer: String,
    /// Nearest-cell value; `None` outside the grid or on no-data.
    pub value: Option<f64>,
    pub in_grid: bool,
    pub in_territory: bool,
}

/// Sample every `(name, raster)` layer at every point, points outermost.
pub fn sample_points(points: &[SamplePoint], layers: &[(&str, &Raster)], territory: &TerritoryMask) -> Vec<SampleValue> {
    let grid = territory.grid();
    let mut out = Vec::with_capacity(points.len() * layers.len());
    for p in points {
        let cell = grid.cell_at(p.lat, p.lon);
        let in_territory = cell.is_some_and(|i| territory.contains(i));
        for (name, raster) in layers {
            out.push(SampleValue {
                point: p.name.clone(),
                lat: p.lat,
                lon: p.lon,
                layer: name.to_string(),
                value: raster.sample(p.lat, p.lon),
                in_grid: cell.is_some(),
                in_territory,
            });
        }
    }
    out
}

/// Major Uzbek cities, used when no point file is supplied.
pub fn reference_points() -> Vec<SamplePoint> {
    vec![
        SamplePoint::new("Tashkent", 41.2995, 69.2401),
        SamplePoint::new("Samarkand", 39.6270, 66.9597),
        SamplePoint::new("Bukhara", 39.7747, 64.4207),
        SamplePoint::new("Andijan", 40.7821, 72.3442),
        SamplePoint::new("Nukus", 42.4531, 59.6103),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::raster::DEFAULT_NODATA;

    #[test]
    fn nearest_cell_lookup_and_flags() {
        let g = Grid::new(0.0, 0.0, 2.0, 2.0, 1.0).unwrap();
        // Row 0 = south.
        let r = Raster::new(g, vec![1.0, 2.0, 3.0, DEFAULT_NODATA], DEFAULT_NODATA).unwrap();
        let territory = TerritoryMask::from_raster(&Raster::new(g, vec![1.0, 1.0, 1.0, 0.0], DEFAULT_NODATA).unwrap());
        let points = vec![
            SamplePoint::new("sw", 0.2, 0.3),
            SamplePoint::new("nw", 1.7, 0.1),
            SamplePoint::new("ne", 1.5, 1.5),
            SamplePoint::new("away", 10.0, 10.0),
        ];
        let got = sample_points(&points, &[("CO2", &r)], &territory);
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].value, Some(1.0));
        assert_eq!(got[1].value, Some(3.0));
        assert_eq!(got[2].value, None);
        assert!(got[2].in_grid && !got[2].in_territory);
        assert!(!got[3].in_grid);
        assert_eq!(got[3].value, None);
    }

    #[test]
    fn reference_points_fall_in_reference_grid() {
        let g = Grid::new(55.9, 37.2, 73.2, 45.6, 0.01).unwrap();
        for p in reference_points() {
            assert!(g.cell_at(p.lat, p.lon).is_some(), "{}", p.name);
        }
    }

    #[test]
    fn one_value_per_point_and_layer() {
        let g = Grid::new(0.0, 0.0, 1.0, 1.0, 1.0).unwrap();
        let a = Raster::filled(g, 1.0);
        let b = Raster::filled(g, 2.0);
        let got = sample_points(&reference_points()[..2], &[("CO2", &a), ("combined", &b)], &TerritoryMask::full(g));
        let layers: Vec<_> = got.iter().map(|s| (s.point.as_str(), s.layer.as_str())).collect();
        assert_eq!(layers, vec![("Tashkent", "CO2"), ("Tashkent", "combined"), ("Samarkand", "CO2"), ("Samarkand", "combined")]);
    }
}
