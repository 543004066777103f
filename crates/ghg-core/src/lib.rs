//! Spatial disaggregation of national greenhouse-gas inventories.
//!
//! A flat category × gas inventory is classified into allocation sectors,
//! each sector is spread over the territory by a weight raster fused from
//! auxiliary covariates, and every gas raster is corrected so that its cell
//! sum reproduces the reported national total.
//!
//! Stage order: inventory → classifier → (provider, composite) → allocation
//! → distributor → balance → validator. [`pipeline::Downscaler`] runs them
//! all.

pub mod allocation;
pub mod balance;
pub mod classifier;
pub mod composite;
pub mod config;
pub mod distributor;
pub mod export;
pub mod gas;
pub mod grid;
pub mod inventory;
pub mod mask;
pub mod pipeline;
pub mod provider;
pub mod raster;
pub mod report;
pub mod sector;
pub mod validator;

pub use config::DownscaleConfig;
pub use gas::Gas;
pub use grid::Grid;
pub use inventory::{Inventory, InventoryRecord};
pub use mask::TerritoryMask;
pub use pipeline::{DownscaleResult, Downscaler, PipelineError};
pub use raster::Raster;
pub use sector::SectorType;
