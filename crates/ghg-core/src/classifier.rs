//! Rule-based mapping of inventory categories onto sector types.
//!
//! Rules are an explicit ordered list of `(predicate, sector)` pairs,
//! evaluated first-match-wins. The list always ends with an
//! [`Predicate::Always`] rule carrying the default sector, so classification
//! is total: every string, including the empty one, gets exactly one sector.

use std::collections::BTreeSet;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::inventory::{Inventory, InventoryRecord};
use crate::sector::SectorType;

/// Keyword rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub sector: SectorType,
    pub keywords: Vec<String>,
}

impl KeywordRule {
    pub fn new(sector: SectorType, keywords: &[&str]) -> Self {
        Self { sector, keywords: keywords.iter().map(|k| k.to_string()).collect() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches when any keyword is a case-insensitive substring.
    /// Keywords are stored lower-cased.
    AnyKeyword(Vec<String>),
    Always,
}

impl Predicate {
    fn matches(&self, category_lower: &str) -> bool {
        match self {
            Predicate::AnyKeyword(kws) => kws.iter().any(|k| category_lower.contains(k.as_str())),
            Predicate::Always => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub predicate: Predicate,
    pub sector: SectorType,
}

/// Result of classifying one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub sector: SectorType,
    /// Position of the winning rule.
    pub rule_index: usize,
    /// True when only the default rule matched.
    pub unclassified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectorClassifier {
    rules: Vec<Rule>,
}

impl SectorClassifier {
    pub fn new(keyword_rules: &[KeywordRule], default_sector: SectorType) -> Self {
        let mut rules: Vec<Rule> = keyword_rules
            .iter()
            .map(|r| Rule {
                predicate: Predicate::AnyKeyword(
                    r.keywords
                        .iter()
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect(),
                ),
                sector: r.sector,
            })
            .collect();
        rules.push(Rule { predicate: Predicate::Always, sector: default_sector });
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn default_sector(&self) -> SectorType {
        // The constructor always appends the default rule last.
        self.rules[self.rules.len() - 1].sector
    }

    pub fn classify(&self, category: &str) -> Classification {
        let lower = category.to_lowercase();
        let last = self.rules.len() - 1;
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.predicate.matches(&lower) {
                return Classification { sector: rule.sector, rule_index: i, unclassified: i == last };
            }
        }
        // Unreachable while the Always rule is present; kept total regardless.
        Classification { sector: self.default_sector(), rule_index: last, unclassified: true }
    }
}

/// Reference rule set, highest priority first.
pub fn reference_rules() -> Vec<KeywordRule> {
    vec![
        KeywordRule::new(SectorType::EnergyIndustries, &["energy industries", "electricity", "power"]),
        KeywordRule::new(SectorType::Transport, &["transport", "road", "aviation", "navigation"]),
        KeywordRule::new(
            SectorType::Agriculture,
            &["enteric", "fermentation", "agriculture", "livestock", "soil"],
        ),
        KeywordRule::new(
            SectorType::Manufacturing,
            &["manufacturing", "industrial", "cement", "steel", "glass"],
        ),
    ]
}

impl Default for SectorClassifier {
    fn default() -> Self {
        Self::new(&reference_rules(), SectorType::Residential)
    }
}

// ── Inventory classification ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRecord {
    pub record: InventoryRecord,
    pub sector: SectorType,
}

/// A category that only the default rule matched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Unclassified {
    pub category: String,
    pub fallback_sector: SectorType,
}

impl SectorClassifier {
    /// Assign every record a sector. Unclassified categories are logged once
    /// each and returned for the run report.
    pub fn classify_inventory(&self, inventory: &Inventory) -> (Vec<ClassifiedRecord>, Vec<Unclassified>) {
        let mut unclassified = BTreeSet::new();
        let records = inventory
            .records()
            .iter()
            .map(|r| {
                let c = self.classify(&r.category);
                if c.unclassified {
                    unclassified.insert(Unclassified { category: r.category.clone(), fallback_sector: c.sector });
                }
                ClassifiedRecord { record: r.clone(), sector: c.sector }
            })
            .collect();
        for u in &unclassified {
            warn!("category {:?} matched no rule, allocated as {}", u.category, u.fallback_sector);
        }
        (records, unclassified.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_categories_map_to_expected_sectors() {
        let c = SectorClassifier::default();
        let cases = [
            ("1.A.1 - Energy Industries - Solid Fuels", SectorType::EnergyIndustries),
            ("Road Transportation – Liquid Fuels", SectorType::Transport),
            ("3.A.1 - Enteric Fermentation", SectorType::Agriculture),
            ("Direct N2O Emissions from managed soils", SectorType::Agriculture),
            ("2.A.1 - Cement production", SectorType::Manufacturing),
            ("1.A.2 - Manufacturing Industries and Construction", SectorType::Manufacturing),
        ];
        for (cat, expected) in cases {
            let got = c.classify(cat);
            assert_eq!(got.sector, expected, "{cat}");
            assert!(!got.unclassified, "{cat}");
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        // "power" (energy) precedes "road" (transport) in priority.
        let c = SectorClassifier::default();
        let got = c.classify("Power supply for road lighting");
        assert_eq!(got.sector, SectorType::EnergyIndustries);
        assert_eq!(got.rule_index, 0);
    }

    #[test]
    fn unmatched_category_falls_back_and_is_flagged() {
        let c = SectorClassifier::default();
        let got = c.classify("4.A - Solid Waste Disposal");
        assert_eq!(got.sector, SectorType::Residential);
        assert!(got.unclassified);
        assert_eq!(got.rule_index, c.rules().len() - 1);
    }

    #[test]
    fn classification_is_total_for_odd_input() {
        let c = SectorClassifier::new(&[], SectorType::Manufacturing);
        for s in ["", "   ", "ÄÖÜ ✓", "\u{0}", "x"] {
            let got = c.classify(s);
            assert_eq!(got.sector, SectorType::Manufacturing);
            assert!(got.unclassified);
        }
    }

    #[test]
    fn blank_keywords_never_match_everything() {
        let rules = vec![KeywordRule::new(SectorType::Transport, &["", "  "])];
        let c = SectorClassifier::new(&rules, SectorType::Residential);
        assert_eq!(c.classify("anything").sector, SectorType::Residential);
    }

    #[test]
    fn inventory_classification_reports_each_unclassified_category_once() {
        use crate::gas::Gas;
        let (inv, _) = Inventory::from_records(vec![
            InventoryRecord::new("4.A Solid Waste Disposal", Gas::Ch4, 10.0),
            InventoryRecord::new("4.A Solid Waste Disposal", Gas::Co2, 1.0),
            InventoryRecord::new("1.A.3.b Road Transportation", Gas::Co2, 5.0),
        ]);
        let (records, unclassified) = SectorClassifier::default().classify_inventory(&inv);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].sector, SectorType::Transport);
        assert_eq!(
            unclassified,
            vec![Unclassified {
                category: "4.A Solid Waste Disposal".to_string(),
                fallback_sector: SectorType::Residential
            }]
        );
    }

    #[test]
    fn configured_default_is_reported() {
        let c = SectorClassifier::new(&reference_rules(), SectorType::Agriculture);
        assert_eq!(c.default_sector(), SectorType::Agriculture);
        assert!(matches!(c.rules().last().map(|r| &r.predicate), Some(Predicate::Always)));
    }
}
