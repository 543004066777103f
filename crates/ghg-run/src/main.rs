/// Batch driver: downscales one inventory year onto the configured grid and
/// writes georeferenced rasters, the run report and point samples.
///
/// Output layout under `--output`:
///   <prefix>_<GAS>.{asc,prj,json}     one bundle per gas
///   <prefix>_combined.{asc,prj,json}  sum over gases
///   weights/weights_<sector>.*        with --write-weights
///   report.json, samples.json
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use ghg_core::export::{write_raster, RasterMetadata};
use ghg_core::inventory::InventoryFormat;
use ghg_core::provider::DirectoryProvider;
use ghg_core::validator::{reference_points, sample_points, SamplePoint};
use ghg_core::{DownscaleConfig, Downscaler, Inventory, Raster, TerritoryMask};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ghg-run", about = "Spatially disaggregate a national GHG inventory onto a grid")]
struct Args {
    /// Inventory table: .json rows or delimited text with a header
    inventory: PathBuf,

    /// Field delimiter for text inventories
    #[arg(long, default_value = ";")]
    delimiter: char,

    /// Run configuration JSON (default: reference tables and grid)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of resampled auxiliary layers (<name>.json)
    #[arg(long, default_value = "data/layers")]
    layers: PathBuf,

    /// Territory mask Raster JSON (cells > 0 are in territory)
    #[arg(long, conflicts_with = "polygon")]
    mask: Option<PathBuf>,

    /// Territory boundary as a JSON array of [lon, lat] vertices
    #[arg(long)]
    polygon: Option<PathBuf>,

    /// Sample points JSON: [{"name", "lat", "lon"}, ...] (default: major cities)
    #[arg(long)]
    points: Option<PathBuf>,

    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    #[arg(long, default_value = "downscaled")]
    prefix: String,

    /// Inventory year, recorded in metadata
    #[arg(long)]
    year: Option<u32>,

    /// Physical units of the inventory quantities
    #[arg(long, default_value = "Gg CO2-eq")]
    units: String,

    /// Also export the per-sector allocation weights
    #[arg(long)]
    write_weights: bool,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load_territory(args: &Args, config: &DownscaleConfig) -> Result<TerritoryMask> {
    if let Some(path) = &args.mask {
        let raster: Raster = read_json(path)?;
        config
            .grid
            .ensure_aligned(raster.grid())
            .with_context(|| format!("Mask {} is not on the run grid", path.display()))?;
        return Ok(TerritoryMask::from_raster(&raster));
    }
    if let Some(path) = &args.polygon {
        let ring: Vec<[f64; 2]> = read_json(path)?;
        if ring.len() < 3 {
            bail!("Polygon {} needs at least 3 vertices, got {}", path.display(), ring.len());
        }
        return Ok(TerritoryMask::from_polygon(config.grid, &ring));
    }
    warn!("no --mask or --polygon given; using the whole grid as territory");
    Ok(TerritoryMask::full(config.grid))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DownscaleConfig::load(path).with_context(|| format!("Cannot load config {}", path.display()))?,
        None => DownscaleConfig::default(),
    };
    let downscaler = Downscaler::new(config).context("Invalid configuration")?;
    let config = downscaler.config();
    info!("[ghg-run] grid {}", config.grid);

    let format = InventoryFormat::for_path(&args.inventory, args.delimiter);
    let (inventory, load_report) = Inventory::load(&args.inventory, format, config.max_drop_rate)
        .with_context(|| format!("Cannot load inventory {}", args.inventory.display()))?;
    info!("[ghg-run] inventory: {} records, gases {:?}", inventory.len(), inventory.gases());

    let territory = load_territory(&args, config)?;
    let provider = DirectoryProvider::new(&args.layers);
    let result = downscaler
        .run_loaded(&inventory, load_report, &provider, &territory)
        .context("Downscaling failed")?;

    fs::create_dir_all(&args.output).with_context(|| format!("Cannot create {}", args.output.display()))?;

    for e in &result.emissions {
        let mut meta = RasterMetadata::describe(e.gas.as_str(), &args.units, &e.raster);
        meta.inventory_total = Some(e.balance.inventory_total);
        meta.correction_factor = Some(e.balance.correction_factor);
        meta.year = args.year;
        let path = write_raster(&args.output, &format!("{}_{}", args.prefix, e.gas), &e.raster, &meta)?;
        info!("[ghg-run] {} → {} (total {:.6e})", e.gas, path.display(), e.balance.corrected_total);
    }

    let mut meta = RasterMetadata::describe("combined", &args.units, &result.combined);
    meta.year = args.year;
    write_raster(&args.output, &format!("{}_combined", args.prefix), &result.combined, &meta)?;

    if args.write_weights {
        let dir = args.output.join("weights");
        for (sector, w) in &result.sector_weights {
            let meta = RasterMetadata::describe(sector.label(), "fraction", &w.raster);
            write_raster(&dir, &format!("weights_{}", sector.slug()), &w.raster, &meta)?;
        }
        info!("[ghg-run] {} weight raster(s) → {}", result.sector_weights.len(), dir.display());
    }

    let points: Vec<SamplePoint> = match &args.points {
        Some(path) => read_json(path)?,
        None => reference_points(),
    };
    let mut layers: Vec<(&str, &Raster)> = result.emissions.iter().map(|e| (e.gas.as_str(), &e.raster)).collect();
    layers.push(("combined", &result.combined));
    let samples = sample_points(&points, &layers, &territory);
    for s in samples.iter().filter(|s| s.layer == "combined") {
        match s.value {
            Some(v) => info!("[ghg-run] {:<12} {v:.6e}", s.point),
            None => info!("[ghg-run] {:<12} no data (in grid: {}, in territory: {})", s.point, s.in_grid, s.in_territory),
        }
    }
    let samples_path = args.output.join("samples.json");
    fs::write(&samples_path, serde_json::to_string_pretty(&samples)?)
        .with_context(|| format!("Write failed: {}", samples_path.display()))?;

    let report_path = args.output.join("report.json");
    fs::write(&report_path, serde_json::to_string_pretty(&result.report)?)
        .with_context(|| format!("Write failed: {}", report_path.display()))?;

    for b in &result.report.balances {
        info!(
            "[ghg-run] {}: inventory {:.6e}, factor {:.9}, relative error {:.2e}",
            b.gas, b.inventory_total, b.correction_factor, b.relative_error
        );
    }
    if !result.report.uniform_fallbacks().is_empty() {
        warn!("[ghg-run] uniform allocation used for {:?}", result.report.uniform_fallbacks());
    }
    info!("[ghg-run] Done → {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["ghg-run", "inventory.csv"]).unwrap();
        assert_eq!(args.delimiter, ';');
        assert_eq!(args.output, PathBuf::from("outputs"));
        assert!(!args.write_weights);
    }

    #[test]
    fn mask_and_polygon_conflict() {
        let r = Args::try_parse_from(["ghg-run", "inv.json", "--mask", "m.json", "--polygon", "p.json"]);
        assert!(r.is_err());
    }

    #[test]
    fn polygon_territory_is_loaded() {
        let dir = std::env::temp_dir().join(format!("ghg-run-poly-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let poly = dir.join("poly.json");
        fs::write(&poly, "[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]]").unwrap();

        let mut config = DownscaleConfig::default();
        config.grid = ghg_core::Grid::new(0.0, 0.0, 4.0, 4.0, 1.0).unwrap();
        let args = Args::try_parse_from(["ghg-run", "inv.json", "--polygon", poly.to_str().unwrap()]).unwrap();
        let territory = load_territory(&args, &config).unwrap();
        assert_eq!(territory.count(), 4);
        fs::remove_dir_all(&dir).ok();
    }
}
