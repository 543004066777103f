//! Mass-balance correction.
//!
//! Every gas raster is multiplied by `inventory_total / realized_total` so
//! that its in-territory sum reproduces the reported national total. The
//! corrected sum is then checked against the relative tolerance; a zero
//! realized total or a corrected sum outside tolerance aborts the run.

use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::distributor::EmissionRaster;
use crate::gas::Gas;
use crate::grid::GridError;
use crate::mask::TerritoryMask;
use crate::raster::Raster;

#[derive(Debug, Error)]
pub enum MassBalanceError {
    #[error("{gas}: realized spatial total is zero but the inventory reports {inventory_total}")]
    ZeroRealizedTotal { gas: Gas, inventory_total: f64 },
    #[error("{gas}: realized spatial total {realized_total} is not finite")]
    NonFinite { gas: Gas, realized_total: f64 },
    #[error(
        "{gas}: corrected total {corrected_total} misses inventory total {inventory_total} \
         (relative error {relative_error:e} > {tolerance:e})"
    )]
    OutOfTolerance { gas: Gas, inventory_total: f64, corrected_total: f64, relative_error: f64, tolerance: f64 },
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Audit record of one correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MassBalance {
    pub gas: Gas,
    pub inventory_total: f64,
    /// In-territory sum before correction.
    pub realized_total: f64,
    pub correction_factor: f64,
    pub corrected_total: f64,
    pub relative_error: f64,
}

/// A gas raster whose sum matches its inventory total.
#[derive(Debug, Clone)]
pub struct BalancedEmission {
    pub gas: Gas,
    pub raster: Raster,
    pub balance: MassBalance,
}

fn relative_error(got: f64, want: f64) -> f64 {
    if want == 0.0 {
        got.abs()
    } else {
        ((got - want) / want).abs()
    }
}

pub fn correct_mass_balance(
    emission: &EmissionRaster,
    territory: &TerritoryMask,
    tolerance: f64,
) -> Result<BalancedEmission, MassBalanceError> {
    let gas = emission.gas;
    let inventory_total = emission.inventory_total;
    let realized_total = emission.realized_total(territory)?;

    if !realized_total.is_finite() {
        return Err(MassBalanceError::NonFinite { gas, realized_total });
    }
    let correction_factor = if realized_total == 0.0 {
        if inventory_total != 0.0 {
            return Err(MassBalanceError::ZeroRealizedTotal { gas, inventory_total });
        }
        1.0
    } else {
        inventory_total / realized_total
    };

    let raster = emission.raster.scaled(correction_factor);
    let corrected_total = raster.sum_within(territory)?;
    let relative_error = relative_error(corrected_total, inventory_total);
    if !(relative_error <= tolerance) {
        return Err(MassBalanceError::OutOfTolerance {
            gas,
            inventory_total,
            corrected_total,
            relative_error,
            tolerance,
        });
    }

    info!(
        "{gas}: inventory {inventory_total:.6e}, realized {realized_total:.6e}, \
         factor {correction_factor:.9}, corrected {corrected_total:.6e}"
    );
    Ok(BalancedEmission {
        gas,
        raster,
        balance: MassBalance {
            gas,
            inventory_total,
            realized_total,
            correction_factor,
            corrected_total,
            relative_error,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::raster::DEFAULT_NODATA;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn grid() -> Grid {
        Grid::new(0.0, 0.0, 4.0, 1.0, 1.0).unwrap()
    }

    fn emission(values: [f64; 4], inventory_total: f64) -> EmissionRaster {
        EmissionRaster {
            gas: Gas::Co2,
            raster: Raster::new(grid(), values.to_vec(), DEFAULT_NODATA).unwrap(),
            inventory_total,
            sector_totals: BTreeMap::new(),
        }
    }

    #[test]
    fn exact_distribution_has_unit_factor() {
        let e = emission([60.0, 45.0, 30.0, 15.0], 150.0);
        let b = correct_mass_balance(&e, &TerritoryMask::full(grid()), 1e-6).unwrap();
        assert_eq!(b.balance.correction_factor, 1.0);
        assert_eq!(b.raster.data(), e.raster.data());
    }

    #[test]
    fn drifted_weights_are_corrected() {
        // Weights 0.4 / 0.3 / 0.2 / 0.099 sum to 0.999.
        let e = emission([60.0, 45.0, 30.0, 150.0 * 0.099], 150.0);
        let b = correct_mass_balance(&e, &TerritoryMask::full(grid()), 1e-6).unwrap();
        assert_relative_eq!(b.balance.correction_factor, 150.0 / 149.85, epsilon = 1e-12);
        assert_relative_eq!(b.raster.sum(), 150.0, max_relative = 1e-12);
        for (before, after) in e.raster.data().iter().zip(b.raster.data()) {
            assert!(((after - before) / before).abs() < 0.002);
        }
    }

    #[test]
    fn zero_realized_with_positive_inventory_is_fatal() {
        let e = emission([0.0; 4], 10.0);
        let err = correct_mass_balance(&e, &TerritoryMask::full(grid()), 1e-6).unwrap_err();
        assert!(matches!(err, MassBalanceError::ZeroRealizedTotal { gas: Gas::Co2, .. }));
    }

    #[test]
    fn zero_inventory_and_zero_realized_is_accepted() {
        let e = emission([0.0; 4], 0.0);
        let b = correct_mass_balance(&e, &TerritoryMask::full(grid()), 1e-6).unwrap();
        assert_eq!(b.balance.correction_factor, 1.0);
        assert_eq!(b.balance.corrected_total, 0.0);
    }

    #[test]
    fn correction_is_restricted_to_territory() {
        let mask = Raster::new(grid(), vec![1.0, 1.0, 1.0, 0.0], DEFAULT_NODATA).unwrap();
        let territory = TerritoryMask::from_raster(&mask);
        let e = emission([1.0, 1.0, 2.0, DEFAULT_NODATA], 8.0);
        let b = correct_mass_balance(&e, &territory, 1e-6).unwrap();
        assert_relative_eq!(b.balance.correction_factor, 2.0);
        assert_relative_eq!(b.raster.sum_within(&territory).unwrap(), 8.0);
    }

    #[test]
    fn non_finite_total_is_fatal() {
        let e = emission([f64::MAX, f64::MAX, 0.0, 0.0], 1.0);
        assert!(matches!(
            correct_mass_balance(&e, &TerritoryMask::full(grid()), 1e-6),
            Err(MassBalanceError::NonFinite { .. })
        ));
    }
}
