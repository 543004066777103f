use serde::{Deserialize, Serialize};

/// Spatial-allocation archetype an inventory category is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SectorType {
    EnergyIndustries,
    Transport,
    Agriculture,
    Manufacturing,
    Residential,
}

impl SectorType {
    pub const ALL: [SectorType; 5] = [
        SectorType::EnergyIndustries,
        SectorType::Transport,
        SectorType::Agriculture,
        SectorType::Manufacturing,
        SectorType::Residential,
    ];

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            SectorType::EnergyIndustries => "Energy Industries",
            SectorType::Transport => "Transport",
            SectorType::Agriculture => "Agriculture",
            SectorType::Manufacturing => "Manufacturing",
            SectorType::Residential => "Residential",
        }
    }

    /// Lower-case identifier used in output file names.
    pub fn slug(self) -> &'static str {
        match self {
            SectorType::EnergyIndustries => "energy_industries",
            SectorType::Transport => "transport",
            SectorType::Agriculture => "agriculture",
            SectorType::Manufacturing => "manufacturing",
            SectorType::Residential => "residential",
        }
    }
}

impl std::fmt::Display for SectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
