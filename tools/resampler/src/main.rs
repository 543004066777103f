/// Auxiliary-layer resampler: decodes a single-band GeoTIFF and writes it as
/// a Raster JSON on the downscaling grid, ready for `ghg-run --layers`.
///
/// GeoTIFF storage order: row 0 = northernmost (N→S).
/// Raster storage order:  row 0 = min_lat (S→N).
/// Georeferencing comes from the ModelTiepoint/ModelPixelScale tags, or from
/// `--bounds` when the file carries none.
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ghg_core::{DownscaleConfig, Grid, Raster};
use ghg_core::raster::DEFAULT_NODATA;
use log::{info, warn};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Method {
    /// Value of the source pixel under each cell centre.
    Nearest,
    /// Mean of the source pixels whose centres fall in each cell.
    Mean,
}

#[derive(Parser, Debug)]
#[command(name = "resampler", about = "Resample a GeoTIFF covariate onto the downscaling grid")]
struct Args {
    /// Single-band GeoTIFF to read
    input: PathBuf,

    /// Output Raster JSON (conventionally <layers-dir>/<layer>.json)
    #[arg(short, long)]
    output: PathBuf,

    /// Source extent "min_lon,min_lat,max_lon,max_lat"; overrides GeoTIFF tags
    #[arg(long)]
    bounds: Option<String>,

    /// Run configuration whose grid is the target (default: reference grid)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target grid "min_lon,min_lat,max_lon,max_lat,cell_size"; overrides --config
    #[arg(long)]
    grid: Option<String>,

    #[arg(long, value_enum, default_value = "nearest")]
    method: Method,

    /// Emit a 0/1 indicator of this land-cover class code instead of values
    #[arg(long)]
    class: Option<u32>,

    /// Source no-data value (default: GDAL_NODATA tag if present)
    #[arg(long)]
    nodata: Option<f64>,

    /// Rescale to [0, 1] by the 2nd/98th percentiles
    #[arg(long)]
    unit_scale: bool,

    #[arg(long, default_value = "0.02")]
    q_lo: f64,

    #[arg(long, default_value = "0.98")]
    q_hi: f64,
}

// ── Source raster ────────────────────────────────────────────────────────────

/// Decoded source band in GeoTIFF order with its georeferencing.
#[derive(Debug, Clone)]
struct Source {
    data: Vec<f64>,
    cols: usize,
    rows: usize,
    min_lon: f64,
    max_lat: f64,
    /// Pixel width and height in degrees.
    px_w: f64,
    px_h: f64,
    nodata: Option<f64>,
}

impl Source {
    fn value(&self, row: usize, col: usize) -> Option<f64> {
        let v = self.data[row * self.cols + col];
        let is_nodata = self.nodata.is_some_and(|nd| v == nd);
        (v.is_finite() && !is_nodata).then_some(v)
    }

    fn pixel_at(&self, lat: f64, lon: f64) -> Option<(usize, usize)> {
        let c = ((lon - self.min_lon) / self.px_w).floor();
        let r = ((self.max_lat - lat) / self.px_h).floor();
        if c < 0.0 || r < 0.0 || c >= self.cols as f64 || r >= self.rows as f64 {
            return None;
        }
        Some((r as usize, c as usize))
    }

    fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lat = self.max_lat - (row as f64 + 0.5) * self.px_h;
        let lon = self.min_lon + (col as f64 + 0.5) * self.px_w;
        (lat, lon)
    }

    /// Replace valid values by 1.0 where equal to `code`, else 0.0.
    fn class_indicator(mut self, code: u32) -> Self {
        let code = f64::from(code);
        for i in 0..self.data.len() {
            let (r, c) = (i / self.cols, i % self.cols);
            if self.value(r, c).is_some() {
                self.data[i] = if self.data[i] == code { 1.0 } else { 0.0 };
            }
        }
        self
    }
}

fn parse_list(text: &str, n: usize, what: &str) -> Result<Vec<f64>> {
    let values: Vec<f64> = text
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Cannot parse {what} {text:?}"))?;
    if values.len() != n {
        bail!("{what} needs {n} comma-separated numbers, got {}", values.len());
    }
    Ok(values)
}

fn decode(args: &Args) -> Result<Source> {
    let file = fs::File::open(&args.input).with_context(|| format!("Cannot open {}", args.input.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .with_context(|| format!("{} is not a valid TIFF", args.input.display()))?;
    let (width, height) = decoder.dimensions()?;
    let (cols, rows) = (width as usize, height as usize);
    if cols == 0 || rows == 0 {
        bail!("{} has zero size", args.input.display());
    }

    let (min_lon, max_lat, px_w, px_h) = match &args.bounds {
        Some(b) => {
            let v = parse_list(b, 4, "--bounds")?;
            (v[0], v[3], (v[2] - v[0]) / cols as f64, (v[3] - v[1]) / rows as f64)
        }
        None => {
            let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok();
            let tie = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok();
            match (scale, tie) {
                (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
                    (t[3] - t[0] * s[0], t[4] + t[1] * s[1], s[0], s[1])
                }
                _ => bail!("{} has no georeferencing tags; pass --bounds", args.input.display()),
            }
        }
    };
    if !(px_w > 0.0 && px_h > 0.0) {
        bail!("Source pixel size must be positive (got {px_w} x {px_h})");
    }

    let nodata = args.nodata.or_else(|| {
        decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse().ok())
    });

    let data: Vec<f64> = match decoder.read_image()? {
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        _ => bail!("Unsupported pixel type in {}", args.input.display()),
    };
    if data.len() != cols * rows {
        bail!("Expected a single band of {} pixels, decoded {}", cols * rows, data.len());
    }

    Ok(Source { data, cols, rows, min_lon, max_lat, px_w, px_h, nodata })
}

fn target_grid(args: &Args) -> Result<Grid> {
    if let Some(g) = &args.grid {
        let v = parse_list(g, 5, "--grid")?;
        return Grid::new(v[0], v[1], v[2], v[3], v[4]).context("Invalid --grid");
    }
    match &args.config {
        Some(path) => Ok(DownscaleConfig::load(path).with_context(|| format!("Cannot load {}", path.display()))?.grid),
        None => Ok(DownscaleConfig::default().grid),
    }
}

// ── Resampling ───────────────────────────────────────────────────────────────

fn resample_nearest(src: &Source, grid: &Grid) -> Raster {
    Raster::from_fn(*grid, |r, c| {
        let (lat, lon) = grid.cell_center(r, c);
        src.pixel_at(lat, lon)
            .and_then(|(pr, pc)| src.value(pr, pc))
            .unwrap_or(DEFAULT_NODATA)
    })
}

/// Cell mean of contributing source pixels. Cells finer than the source
/// receive no pixel centre and take the nearest value instead.
fn resample_mean(src: &Source, grid: &Grid) -> Raster {
    let mut sum = vec![0.0f64; grid.len()];
    let mut count = vec![0u32; grid.len()];
    for pr in 0..src.rows {
        for pc in 0..src.cols {
            let Some(v) = src.value(pr, pc) else {
                continue;
            };
            let (lat, lon) = src.pixel_center(pr, pc);
            if let Some(i) = grid.cell_at(lat, lon) {
                sum[i] += v;
                count[i] += 1;
            }
        }
    }
    let nearest = resample_nearest(src, grid);
    Raster::from_fn(*grid, |r, c| {
        let i = grid.index(r, c);
        if count[i] > 0 {
            sum[i] / f64::from(count[i])
        } else {
            nearest.data()[i]
        }
    })
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let grid = target_grid(&args)?;
    let mut src = decode(&args)?;
    info!(
        "[resampler] {}: {}x{} px, {:.5}° pixels, origin ({}, {})",
        args.input.display(),
        src.cols,
        src.rows,
        src.px_w,
        src.min_lon,
        src.max_lat
    );
    if let Some(code) = args.class {
        src = src.class_indicator(code);
        info!("[resampler] class {code} indicator");
    }

    let mut raster = match args.method {
        Method::Nearest => resample_nearest(&src, &grid),
        Method::Mean => resample_mean(&src, &grid),
    };
    if args.unit_scale {
        raster = raster.unit_scaled(args.q_lo, args.q_hi);
    }

    let valid = raster.valid_count();
    if valid == 0 {
        warn!("[resampler] no valid cells: does the source cover the grid?");
    }
    if let Some(parent) = args.output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.output, serde_json::to_string(&raster)?)
        .with_context(|| format!("Write failed: {}", args.output.display()))?;
    info!("[resampler] {} → {} ({valid}/{} valid cells)", grid, args.output.display(), grid.len());
    Ok(())
}
