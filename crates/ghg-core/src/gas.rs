//! Validated greenhouse-gas vocabulary and GWP multipliers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Gas {
    #[serde(rename = "CO2")]
    Co2,
    #[serde(rename = "CH4")]
    Ch4,
    #[serde(rename = "N2O")]
    N2o,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised gas code {0:?}")]
pub struct UnknownGas(pub String);

impl Gas {
    /// Processing order of every run.
    pub const ALL: [Gas; 3] = [Gas::Co2, Gas::Ch4, Gas::N2o];

    pub fn as_str(self) -> &'static str {
        match self {
            Gas::Co2 => "CO2",
            Gas::Ch4 => "CH4",
            Gas::N2o => "N2O",
        }
    }

    /// Case- and whitespace-insensitive parse. Unicode subscript digits are
    /// folded ("CH₄" → "CH4"); anything outside the vocabulary, including
    /// mis-encoded codes such as "CH2", is rejected.
    pub fn parse(code: &str) -> Result<Gas, UnknownGas> {
        let folded: String = code
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(fold_subscript)
            .collect::<String>()
            .to_ascii_uppercase();
        match folded.as_str() {
            "CO2" => Ok(Gas::Co2),
            "CH4" => Ok(Gas::Ch4),
            "N2O" => Ok(Gas::N2o),
            _ => Err(UnknownGas(code.to_string())),
        }
    }
}

fn fold_subscript(c: char) -> char {
    match c {
        '₀'..='₉' => char::from(b'0' + (c as u32 - '₀' as u32) as u8),
        other => other,
    }
}

impl FromStr for Gas {
    type Err = UnknownGas;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Gas::parse(s)
    }
}

impl std::fmt::Display for Gas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global-warming-potential multipliers applied when the combined raster is
/// built in CO2-equivalent. Defaults are IPCC AR4 100-year values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GwpTable {
    pub co2: f64,
    pub ch4: f64,
    pub n2o: f64,
}

impl GwpTable {
    pub fn factor(&self, gas: Gas) -> f64 {
        match gas {
            Gas::Co2 => self.co2,
            Gas::Ch4 => self.ch4,
            Gas::N2o => self.n2o,
        }
    }
}

impl Default for GwpTable {
    fn default() -> Self {
        Self { co2: 1.0, ch4: 25.0, n2o: 298.0 }
    }
}
