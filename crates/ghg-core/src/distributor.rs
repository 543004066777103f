//! Emission distributor: spreads each gas's sector totals over the territory
//! with the sector allocation weights.
//!
//! Quantities are first aggregated per sector, then each sector's total is
//! multiplied into its weight raster and accumulated. Because each weight
//! raster sums to 1 over the territory, the realized sum equals the inventory
//! total up to rounding; the mass-balance corrector removes what remains.

use std::collections::BTreeMap;

use log::debug;
use thiserror::Error;

use crate::allocation::SectorWeights;
use crate::classifier::ClassifiedRecord;
use crate::gas::Gas;
use crate::grid::GridError;
use crate::mask::TerritoryMask;
use crate::raster::{compensated_sum, Raster, DEFAULT_NODATA};
use crate::sector::SectorType;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("{gas}: sector {sector} has emissions but no allocation weights")]
    MissingSectorWeights { gas: Gas, sector: SectorType },
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// One gas on the grid, before mass-balance correction.
#[derive(Debug, Clone)]
pub struct EmissionRaster {
    pub gas: Gas,
    pub raster: Raster,
    /// Sum of the gas's inventory quantities.
    pub inventory_total: f64,
    /// Inventory quantity per sector.
    pub sector_totals: BTreeMap<SectorType, f64>,
}

/// Inventory quantity of `gas` per sector.
pub fn sector_totals(gas: Gas, records: &[ClassifiedRecord]) -> BTreeMap<SectorType, f64> {
    let mut grouped: BTreeMap<SectorType, Vec<f64>> = BTreeMap::new();
    for r in records.iter().filter(|r| r.record.gas == gas) {
        grouped.entry(r.sector).or_default().push(r.record.emissions_quantity);
    }
    grouped.into_iter().map(|(s, q)| (s, compensated_sum(q))).collect()
}

pub fn distribute_gas(
    gas: Gas,
    records: &[ClassifiedRecord],
    weights: &BTreeMap<SectorType, SectorWeights>,
    territory: &TerritoryMask,
) -> Result<EmissionRaster, DistributionError> {
    let grid = *territory.grid();
    let totals = sector_totals(gas, records);

    let mut acc: Vec<f64> = (0..grid.len())
        .map(|i| if territory.contains(i) { 0.0 } else { DEFAULT_NODATA })
        .collect();

    for (&sector, &quantity) in &totals {
        let w = weights
            .get(&sector)
            .ok_or(DistributionError::MissingSectorWeights { gas, sector })?;
        grid.ensure_aligned(w.raster.grid())?;
        if quantity == 0.0 {
            continue;
        }
        for i in territory.cells() {
            if let Some(v) = w.raster.value(i) {
                acc[i] += quantity * v;
            }
        }
        debug!("{gas}: {sector} carries {quantity:.6e}");
    }

    let inventory_total = compensated_sum(totals.values().copied());
    Ok(EmissionRaster { gas, raster: Raster::new(grid, acc, DEFAULT_NODATA)?, inventory_total, sector_totals: totals })
}

impl EmissionRaster {
    /// Sum of the raster over the territory.
    pub fn realized_total(&self, territory: &TerritoryMask) -> Result<f64, GridError> {
        self.raster.sum_within(territory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::inventory::InventoryRecord;
    use approx::assert_relative_eq;

    fn grid() -> Grid {
        Grid::new(0.0, 0.0, 4.0, 1.0, 1.0).unwrap()
    }

    fn weights(sector: SectorType, values: [f64; 4]) -> SectorWeights {
        SectorWeights::from_normalized(sector, Raster::new(grid(), values.to_vec(), DEFAULT_NODATA).unwrap())
    }

    fn rec(category: &str, gas: Gas, q: f64, sector: SectorType) -> ClassifiedRecord {
        ClassifiedRecord { record: InventoryRecord::new(category, gas, q), sector }
    }

    #[test]
    fn two_records_one_sector() {
        let records = vec![
            rec("CatA", Gas::Co2, 100.0, SectorType::Transport),
            rec("CatB", Gas::Co2, 50.0, SectorType::Transport),
        ];
        let w = BTreeMap::from([(SectorType::Transport, weights(SectorType::Transport, [0.4, 0.3, 0.2, 0.1]))]);
        let e = distribute_gas(Gas::Co2, &records, &w, &TerritoryMask::full(grid())).unwrap();
        let expected = [60.0, 45.0, 30.0, 15.0];
        for (got, want) in e.raster.data().iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
        assert_relative_eq!(e.raster.sum(), 150.0, epsilon = 1e-12);
        assert_relative_eq!(e.inventory_total, 150.0);
    }

    #[test]
    fn other_gases_are_ignored() {
        let records = vec![
            rec("A", Gas::Co2, 10.0, SectorType::Residential),
            rec("B", Gas::Ch4, 99.0, SectorType::Agriculture),
        ];
        let w = BTreeMap::from([(SectorType::Residential, weights(SectorType::Residential, [0.25; 4]))]);
        let e = distribute_gas(Gas::Co2, &records, &w, &TerritoryMask::full(grid())).unwrap();
        assert_relative_eq!(e.raster.sum(), 10.0, epsilon = 1e-12);
        assert_eq!(e.sector_totals.len(), 1);
    }

    #[test]
    fn sectors_accumulate() {
        let records = vec![
            rec("A", Gas::N2o, 4.0, SectorType::Agriculture),
            rec("B", Gas::N2o, 8.0, SectorType::Transport),
        ];
        let w = BTreeMap::from([
            (SectorType::Agriculture, weights(SectorType::Agriculture, [0.0, 0.0, 0.5, 0.5])),
            (SectorType::Transport, weights(SectorType::Transport, [0.5, 0.5, 0.0, 0.0])),
        ]);
        let e = distribute_gas(Gas::N2o, &records, &w, &TerritoryMask::full(grid())).unwrap();
        assert_eq!(e.raster.data(), &[4.0, 4.0, 2.0, 2.0]);
    }

    #[test]
    fn missing_sector_weights_is_fatal() {
        let records = vec![rec("A", Gas::Co2, 1.0, SectorType::Manufacturing)];
        let err = distribute_gas(Gas::Co2, &records, &BTreeMap::new(), &TerritoryMask::full(grid())).unwrap_err();
        assert!(matches!(
            err,
            DistributionError::MissingSectorWeights { gas: Gas::Co2, sector: SectorType::Manufacturing }
        ));
    }

    #[test]
    fn cells_outside_territory_are_nodata() {
        let mask = Raster::new(grid(), vec![1.0, 1.0, 0.0, 0.0], DEFAULT_NODATA).unwrap();
        let territory = TerritoryMask::from_raster(&mask);
        let w = weights(SectorType::Residential, [0.5, 0.5, DEFAULT_NODATA, DEFAULT_NODATA]);
        let records = vec![rec("A", Gas::Co2, 3.0, SectorType::Residential)];
        let e = distribute_gas(Gas::Co2, &records, &BTreeMap::from([(SectorType::Residential, w)]), &territory).unwrap();
        assert_eq!(e.raster.value(2), None);
        assert_relative_eq!(e.realized_total(&territory).unwrap(), 3.0);
    }
}
