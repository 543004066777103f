//! Seam to the external auxiliary-layer provider.
//!
//! The provider hands over rasters already resampled onto the run's grid;
//! the core verifies alignment and never resamples. A layer that does not
//! exist is `Unavailable` and feeds the composite fallback. A `Transient`
//! failure is retried and becomes fatal once attempts are exhausted.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, warn};
use thiserror::Error;

use crate::grid::{Grid, GridError};
use crate::raster::Raster;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("layer {layer:?} is not available")]
    Unavailable { layer: String },
    #[error("transient failure fetching {layer:?}: {reason}")]
    Transient { layer: String, reason: String },
    #[error("layer {layer:?} failed after {attempts} attempts: {reason}")]
    Exhausted { layer: String, attempts: u32, reason: String },
    #[error("layer {layer:?} is not on the run grid: {source}")]
    Misaligned { layer: String, source: GridError },
    #[error("layer {layer:?} is corrupt: {reason}")]
    Corrupt { layer: String, reason: String },
}

pub trait AuxiliaryProvider {
    /// Fetch the named layer on `grid`.
    fn fetch(&self, name: &str, grid: &Grid) -> Result<Raster, ProviderError>;
}

/// Fetch with retries. `Ok(None)` means the layer is unavailable.
pub fn fetch_with_retry(
    provider: &dyn AuxiliaryProvider,
    name: &str,
    grid: &Grid,
    attempts: u32,
) -> Result<Option<Raster>, ProviderError> {
    let attempts = attempts.max(1);
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        match provider.fetch(name, grid) {
            Ok(raster) => {
                grid.ensure_aligned(raster.grid())
                    .map_err(|source| ProviderError::Misaligned { layer: name.to_string(), source })?;
                debug!("layer {name}: fetched on attempt {attempt}");
                return Ok(Some(raster));
            }
            Err(ProviderError::Unavailable { .. }) => return Ok(None),
            Err(ProviderError::Transient { reason, .. }) => {
                warn!("layer {name}: attempt {attempt}/{attempts} failed: {reason}");
                last_reason = reason;
            }
            Err(other) => return Err(other),
        }
    }
    Err(ProviderError::Exhausted { layer: name.to_string(), attempts, reason: last_reason })
}

/// Named raw layers, all on one grid.
#[derive(Debug, Clone)]
pub struct LayerSet {
    grid: Grid,
    layers: BTreeMap<String, Raster>,
    missing: Vec<String>,
}

impl LayerSet {
    pub fn new(grid: Grid) -> Self {
        Self { grid, layers: BTreeMap::new(), missing: Vec::new() }
    }

    /// Fetch every named layer, recording unavailable ones as missing.
    pub fn fetch_all(
        provider: &dyn AuxiliaryProvider,
        names: &[String],
        grid: &Grid,
        attempts: u32,
    ) -> Result<Self, ProviderError> {
        let mut set = Self::new(*grid);
        for name in names {
            match fetch_with_retry(provider, name, grid, attempts)? {
                Some(r) => {
                    set.layers.insert(name.clone(), r);
                }
                None => {
                    warn!("layer {name}: unavailable");
                    set.missing.push(name.clone());
                }
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, name: &str, raster: Raster) -> Result<(), GridError> {
        self.grid.ensure_aligned(raster.grid())?;
        self.missing.retain(|m| m != name);
        self.layers.insert(name.to_string(), raster);
        Ok(())
    }

    pub fn with(mut self, name: &str, raster: Raster) -> Result<Self, GridError> {
        self.insert(name, raster)?;
        Ok(self)
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn get(&self, name: &str) -> Option<&Raster> {
        self.layers.get(name)
    }

    /// Layers that were requested but unavailable.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }
}

/// Provider over rasters held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProvider {
    layers: BTreeMap<String, Raster>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, raster: Raster) -> Self {
        self.layers.insert(name.to_string(), raster);
        self
    }
}

impl AuxiliaryProvider for InMemoryProvider {
    fn fetch(&self, name: &str, _grid: &Grid) -> Result<Raster, ProviderError> {
        self.layers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable { layer: name.to_string() })
    }
}

/// Provider reading serialized rasters from `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    dir: PathBuf,
}

impl DirectoryProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl AuxiliaryProvider for DirectoryProvider {
    fn fetch(&self, name: &str, _grid: &Grid) -> Result<Raster, ProviderError> {
        let path = self.path_for(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::Unavailable { layer: name.to_string() });
            }
            Err(e) => {
                return Err(ProviderError::Transient {
                    layer: name.to_string(),
                    reason: format!("{}: {e}", path.display()),
                });
            }
        };
        serde_json::from_str(&text).map_err(|e| ProviderError::Corrupt {
            layer: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })
    }
}
