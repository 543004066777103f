//! Inventory loading and cleaning.
//!
//! Accepts a JSON array of `{category, gas, emissions_quantity}` objects or a
//! delimited text table with a header row. Every row that cannot become a
//! valid [`InventoryRecord`] is dropped and counted by reason; loading fails
//! only when the drop rate exceeds the configured threshold.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gas::Gas;
use crate::raster::compensated_sum;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("cannot read inventory {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("cannot parse inventory JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inventory header has no {0} column")]
    MissingColumn(&'static str),
    #[error("{dropped} of {total} inventory rows dropped ({rate:.1}%), above the {max:.1}% limit")]
    DropRateExceeded { dropped: usize, total: usize, rate: f64, max: f64 },
    #[error("inventory has no usable rows")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub category: String,
    pub gas: Gas,
    pub emissions_quantity: f64,
}

impl InventoryRecord {
    pub fn new(category: &str, gas: Gas, emissions_quantity: f64) -> Self {
        Self { category: category.to_string(), gas, emissions_quantity }
    }
}

/// Why a row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// JSON row whose fields have the wrong types.
    Malformed,
    MissingCategory,
    UnknownGas,
    MissingQuantity,
    InvalidQuantity,
    NegativeQuantity,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub total_rows: usize,
    pub kept: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    /// Gas codes recovered from a single mis-encoded character ("CO?").
    pub repaired_gas_codes: usize,
    /// Distinct unrecognised gas codes, as written.
    pub unknown_gas_codes: BTreeSet<String>,
}

impl LoadReport {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    pub fn drop_rate(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.dropped_total() as f64 / self.total_rows as f64
        }
    }

    fn drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason).or_insert(0) += 1;
    }
}

/// A row as read, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub emissions_quantity: Option<RawQuantity>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawQuantity {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryFormat {
    Json,
    Delimited(char),
}

impl InventoryFormat {
    /// `.json` files are JSON; everything else is `delimiter`-separated text.
    pub fn for_path(path: &Path, delimiter: char) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => InventoryFormat::Json,
            _ => InventoryFormat::Delimited(delimiter),
        }
    }
}

/// Cleaned inventory. No two records share a `(category, gas)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    records: Vec<InventoryRecord>,
}

impl Inventory {
    /// Clean already-typed records (duplicates and invalid quantities are
    /// dropped the same way as for parsed input).
    pub fn from_records(records: Vec<InventoryRecord>) -> (Self, LoadReport) {
        let rows = records
            .into_iter()
            .map(|r| RawRow {
                category: Some(r.category),
                gas: Some(r.gas.as_str().to_string()),
                emissions_quantity: Some(RawQuantity::Number(r.emissions_quantity)),
            })
            .collect();
        clean_rows(rows, 0)
    }

    pub fn from_raw_rows(rows: Vec<RawRow>, max_drop_rate: f64) -> Result<(Self, LoadReport), InventoryError> {
        let (inv, report) = clean_rows(rows, 0);
        check_report(&report, max_drop_rate)?;
        Ok((inv, report))
    }

    /// The document must be a JSON array. Elements that do not map onto a
    /// row are dropped as [`DropReason::Malformed`].
    pub fn from_json_str(text: &str, max_drop_rate: f64) -> Result<(Self, LoadReport), InventoryError> {
        let values: Vec<serde_json::Value> = serde_json::from_str(text)?;
        let mut malformed = 0;
        let rows: Vec<RawRow> = values
            .into_iter()
            .filter_map(|v| match serde_json::from_value(v) {
                Ok(row) => Some(row),
                Err(e) => {
                    debug!("inventory: malformed row: {e}");
                    malformed += 1;
                    None
                }
            })
            .collect();
        let (inv, report) = clean_rows(rows, malformed);
        check_report(&report, max_drop_rate)?;
        Ok((inv, report))
    }

    pub fn from_delimited_str(
        text: &str,
        delimiter: char,
        max_drop_rate: f64,
    ) -> Result<(Self, LoadReport), InventoryError> {
        let rows = parse_delimited(text, delimiter)?;
        Self::from_raw_rows(rows, max_drop_rate)
    }

    pub fn load(path: &Path, format: InventoryFormat, max_drop_rate: f64) -> Result<(Self, LoadReport), InventoryError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| InventoryError::Io { path: path.display().to_string(), source })?;
        match format {
            InventoryFormat::Json => Self::from_json_str(&text, max_drop_rate),
            InventoryFormat::Delimited(d) => Self::from_delimited_str(&text, d, max_drop_rate),
        }
    }

    pub fn records(&self) -> &[InventoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn for_gas(&self, gas: Gas) -> impl Iterator<Item = &InventoryRecord> + '_ {
        self.records.iter().filter(move |r| r.gas == gas)
    }

    /// Reported national total of one gas.
    pub fn total(&self, gas: Gas) -> f64 {
        compensated_sum(self.for_gas(gas).map(|r| r.emissions_quantity))
    }

    /// Gases with at least one record, in processing order.
    pub fn gases(&self) -> Vec<Gas> {
        Gas::ALL.into_iter().filter(|&g| self.for_gas(g).next().is_some()).collect()
    }
}

fn check_report(report: &LoadReport, max_drop_rate: f64) -> Result<(), InventoryError> {
    let rate = report.drop_rate();
    if rate > max_drop_rate {
        return Err(InventoryError::DropRateExceeded {
            dropped: report.dropped_total(),
            total: report.total_rows,
            rate: rate * 100.0,
            max: max_drop_rate * 100.0,
        });
    }
    if report.kept == 0 {
        return Err(InventoryError::Empty);
    }
    Ok(())
}

/// `malformed` counts rows already rejected before reaching `rows`.
fn clean_rows(rows: Vec<RawRow>, malformed: usize) -> (Inventory, LoadReport) {
    let mut report = LoadReport { total_rows: rows.len() + malformed, ..LoadReport::default() };
    if malformed > 0 {
        report.dropped.insert(DropReason::Malformed, malformed);
    }
    let mut seen: BTreeSet<(String, Gas)> = BTreeSet::new();
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let category = match row.category.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => {
                report.drop(DropReason::MissingCategory);
                continue;
            }
        };
        let gas = match row.gas.as_deref().map(resolve_gas) {
            Some(Some((g, repaired))) => {
                if repaired {
                    report.repaired_gas_codes += 1;
                }
                g
            }
            Some(None) => {
                report.unknown_gas_codes.insert(row.gas.unwrap_or_default());
                report.drop(DropReason::UnknownGas);
                continue;
            }
            None => {
                report.drop(DropReason::UnknownGas);
                continue;
            }
        };
        let quantity = match row.emissions_quantity {
            None => {
                report.drop(DropReason::MissingQuantity);
                continue;
            }
            Some(RawQuantity::Number(v)) => Some(v),
            Some(RawQuantity::Text(ref s)) if s.trim().is_empty() => {
                report.drop(DropReason::MissingQuantity);
                continue;
            }
            Some(RawQuantity::Text(s)) => parse_quantity(&s),
        };
        let quantity = match quantity {
            Some(v) if !v.is_finite() => {
                report.drop(DropReason::InvalidQuantity);
                continue;
            }
            Some(v) if v < 0.0 => {
                report.drop(DropReason::NegativeQuantity);
                continue;
            }
            Some(v) => v,
            None => {
                report.drop(DropReason::InvalidQuantity);
                continue;
            }
        };
        if !seen.insert((category.clone(), gas)) {
            report.drop(DropReason::Duplicate);
            continue;
        }
        records.push(InventoryRecord { category, gas, emissions_quantity: quantity });
    }

    report.kept = records.len();
    if report.dropped_total() > 0 {
        warn!(
            "inventory: dropped {} of {} rows ({})",
            report.dropped_total(),
            report.total_rows,
            report.dropped.iter().map(|(r, n)| format!("{r:?}={n}")).collect::<Vec<_>>().join(", ")
        );
    }
    if !report.unknown_gas_codes.is_empty() {
        warn!("inventory: unknown gas codes {:?}", report.unknown_gas_codes);
    }
    if report.repaired_gas_codes > 0 {
        warn!("inventory: repaired {} mis-encoded gas code(s)", report.repaired_gas_codes);
    }
    info!("inventory: {} record(s) kept", report.kept);
    (Inventory { records }, report)
}

/// Strict parse first; otherwise treat a single `?` or U+FFFD as a lost
/// character and accept the code only if exactly one gas fits it.
fn resolve_gas(code: &str) -> Option<(Gas, bool)> {
    if let Ok(g) = Gas::parse(code) {
        return Some((g, false));
    }
    let pattern: Vec<char> = code
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if pattern.iter().filter(|&&c| c == '?' || c == '\u{FFFD}').count() != 1 {
        return None;
    }
    let mut fits = Gas::ALL.into_iter().filter(|g| {
        let name: Vec<char> = g.as_str().chars().collect();
        name.len() == pattern.len()
            && name.iter().zip(&pattern).all(|(n, p)| *p == '?' || *p == '\u{FFFD}' || n == p)
    });
    match (fits.next(), fits.next()) {
        (Some(g), None) => Some((g, true)),
        _ => None,
    }
}

/// Parse a quantity that may use a decimal comma and space or apostrophe
/// digit grouping ("1 234,5", "1.234,5", "1234.5").
fn parse_quantity(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '\u{202F}')
        .collect();
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    normalized.parse::<f64>().ok()
}

// ── Delimited text ──────────────────────────────────────────────────────────

struct Columns {
    category: usize,
    gas: usize,
    quantity: usize,
}

fn find_columns(header: &[String]) -> Result<Columns, InventoryError> {
    let norm: Vec<String> = header.iter().map(|h| h.trim().trim_start_matches('\u{FEFF}').to_lowercase()).collect();
    let find = |pred: &dyn Fn(&str) -> bool| norm.iter().position(|h| pred(h.as_str()));

    let category = find(&|h| h == "category" || h == "ipcc category")
        .ok_or(InventoryError::MissingColumn("category"))?;
    let gas = find(&|h| h == "gas" || h == "greenhouse gas").ok_or(InventoryError::MissingColumn("gas"))?;
    let quantity = find(&|h| h == "emissions_quantity")
        .or_else(|| find(&|h| h.starts_with("emissions") || h.contains("ex,t")))
        .ok_or(InventoryError::MissingColumn("emissions"))?;
    Ok(Columns { category, gas, quantity })
}

/// Split one line on `delimiter`, honouring double quotes (`""` escapes a quote).
fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn parse_delimited(text: &str, delimiter: char) -> Result<Vec<RawRow>, InventoryError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or(InventoryError::Empty)?;
    let cols = find_columns(&split_fields(header, delimiter))?;

    let field = |fields: &[String], i: usize| fields.get(i).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Ok(lines
        .map(|line| {
            let fields = split_fields(line, delimiter);
            RawRow {
                category: field(&fields, cols.category),
                gas: field(&fields, cols.gas),
                emissions_quantity: field(&fields, cols.quantity).map(RawQuantity::Text),
            }
        })
        .collect())
}
