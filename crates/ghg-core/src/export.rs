//! Georeferenced raster output: ESRI ASCII grid, WGS84 `.prj` and a JSON
//! metadata sidecar.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::grid::GridSpec;
use crate::raster::Raster;

/// ESRI WKT for EPSG:4326.
pub const WGS84_PRJ: &str = "GEOGCS[\"GCS_WGS_1984\",DATUM[\"D_WGS_1984\",\
SPHEROID[\"WGS_1984\",6378137.0,298.257223563]],PRIMEM[\"Greenwich\",0.0],\
UNIT[\"Degree\",0.0174532925199433]]";

pub const CRS: &str = "EPSG:4326";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot write {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("cannot serialize metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sidecar describing one exported raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterMetadata {
    pub layer: String,
    pub units: String,
    pub crs: String,
    pub grid: GridSpec,
    pub width: usize,
    pub height: usize,
    pub nodata: f64,
    pub total: f64,
    pub valid_cells: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
}

impl RasterMetadata {
    pub fn describe(layer: &str, units: &str, raster: &Raster) -> Self {
        let g = raster.grid();
        Self {
            layer: layer.to_string(),
            units: units.to_string(),
            crs: CRS.to_string(),
            grid: g.spec(),
            width: g.width(),
            height: g.height(),
            nodata: raster.nodata(),
            total: raster.sum(),
            valid_cells: raster.valid_count(),
            inventory_total: None,
            correction_factor: None,
            year: None,
        }
    }
}

/// Encode as ESRI ASCII grid. Rows are written north first; invalid cells
/// are written as the raster's no-data value.
pub fn to_ascii_grid(raster: &Raster) -> String {
    let g = raster.grid();
    let mut out = String::with_capacity(g.len() * 8 + 128);
    out.push_str(&format!(
        "ncols {}\nnrows {}\nxllcorner {}\nyllcorner {}\ncellsize {}\nNODATA_value {}\n",
        g.width(),
        g.height(),
        g.min_lon(),
        g.min_lat(),
        g.cell_size(),
        raster.nodata()
    ));
    for row in (0..g.height()).rev() {
        let line: Vec<String> = (0..g.width())
            .map(|col| match raster.get(row, col) {
                Some(v) => v.to_string(),
                None => raster.nodata().to_string(),
            })
            .collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

fn write_file(path: &Path, contents: &str) -> Result<(), ExportError> {
    std::fs::write(path, contents).map_err(|source| ExportError::Io { path: path.display().to_string(), source })
}

/// Write `<stem>.asc`, `<stem>.prj` and `<stem>.json` into `dir`.
/// Returns the path of the `.asc` file.
pub fn write_raster(dir: &Path, stem: &str, raster: &Raster, meta: &RasterMetadata) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io { path: dir.display().to_string(), source })?;
    let asc = dir.join(format!("{stem}.asc"));
    write_file(&asc, &to_ascii_grid(raster))?;
    write_file(&dir.join(format!("{stem}.prj")), WGS84_PRJ)?;
    write_file(&dir.join(format!("{stem}.json")), &serde_json::to_string_pretty(meta)?)?;
    Ok(asc)
}
