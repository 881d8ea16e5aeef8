//! Enriched rows, table rendering, and CSV/JSON export.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classify::EvictionClassification;
use crate::enrich::{source_label, EnrichmentResult};
use crate::pricing::{OperatingSystem, PricingRow};
use crate::EnrichError;

/// One output row: prices plus the eviction classification of its key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRow {
    /// ARM SKU name.
    pub sku: String,
    /// Operating system.
    pub os: OperatingSystem,
    /// ARM region name.
    pub region: String,
    /// Hourly spot price.
    pub spot_price: f64,
    /// Hourly pay-as-you-go price.
    pub payg_price: Option<f64>,
    /// Spot savings, e.g. `70.0%`.
    pub savings: String,
    /// Eviction classification.
    #[serde(flatten)]
    pub classification: EvictionClassification,
}

/// Attach classifications to pricing rows.
///
/// A row whose key is missing from `result` gets the neutral placeholder.
pub fn build_rows(rows: &[PricingRow], result: &EnrichmentResult) -> Vec<EnrichedRow> {
    rows.iter()
        .map(|row| EnrichedRow {
            sku: row.sku.clone(),
            os: row.os,
            region: row.region.clone(),
            spot_price: row.spot_price,
            payg_price: row.payg_price,
            savings: row.savings(),
            classification: result
                .get(&row.score_key())
                .cloned()
                .unwrap_or_else(EvictionClassification::neutral),
        })
        .collect()
}

const HEADERS: [&str; 8] = [
    "SKU",
    "OS",
    "Region",
    "Spot $/hr",
    "PAYG $/hr",
    "Savings",
    "Eviction Risk",
    "Eviction Rate",
];

fn price_cell(price: Option<f64>) -> String {
    price.map_or_else(|| crate::classify::NOT_AVAILABLE.to_string(), |p| format!("{p:.4}"))
}

/// Display cells of one row, in [`HEADERS`] order.
fn row_cells(row: &EnrichedRow) -> [String; 8] {
    [
        row.sku.clone(),
        row.os.to_string(),
        row.region.clone(),
        price_cell(Some(row.spot_price)),
        price_cell(row.payg_price),
        row.savings.clone(),
        row.classification.risk_label().to_string(),
        row.classification.percent_bucket().to_string(),
    ]
}

/// Render rows as a left-aligned plain-text table.
pub fn render_table(rows: &[EnrichedRow]) -> String {
    let cells: Vec<[String; 8]> = rows.iter().map(row_cells).collect();

    let mut widths = HEADERS.map(str::len);
    for line in &cells {
        for (width, cell) in widths.iter_mut().zip(line) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let format_line = |line: &[&str]| -> String {
        line.iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&format_line(&HEADERS[..]));
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join("  "));
    out.push('\n');
    for line in &cells {
        let refs: Vec<&str> = line.iter().map(String::as_str).collect();
        out.push_str(&format_line(&refs));
        out.push('\n');
    }
    out
}

/// JSON export document.
#[derive(Debug, Serialize)]
pub struct ExportDocument<'a> {
    /// Generation timestamp (UTC).
    pub generated_at: DateTime<Utc>,
    /// Number of rows.
    pub row_count: usize,
    /// Rows per classification source.
    pub sources: BTreeMap<&'static str, usize>,
    /// The rows.
    pub rows: &'a [EnrichedRow],
}

impl<'a> ExportDocument<'a> {
    /// Document stamped with the current time.
    pub fn new(rows: &'a [EnrichedRow]) -> Self {
        let mut sources = BTreeMap::new();
        for row in rows {
            *sources.entry(source_label(&row.classification)).or_insert(0) += 1;
        }
        Self {
            generated_at: Utc::now(),
            row_count: rows.len(),
            sources,
            rows,
        }
    }
}

/// Write `rows` to `path` as pretty-printed JSON.
///
/// # Errors
///
/// Returns [`EnrichError::Export`] when serialization or the write fails.
pub fn export_json(path: &Path, rows: &[EnrichedRow]) -> Result<(), EnrichError> {
    let export_error = |source: std::io::Error| EnrichError::Export {
        path: path.display().to_string(),
        source,
    };
    let json = serde_json::to_string_pretty(&ExportDocument::new(rows))
        .map_err(|e| export_error(std::io::Error::other(e)))?;
    std::fs::write(path, json).map_err(export_error)
}

/// Write `rows` to `path` as CSV with the table's columns.
///
/// Cells are the rendered table cells, so prices carry four decimals and
/// missing prices read `N/A`.
///
/// # Errors
///
/// Returns [`EnrichError::Export`] when the file cannot be created or written.
pub fn export_csv(path: &Path, rows: &[EnrichedRow]) -> Result<(), EnrichError> {
    let export_error = |source: std::io::Error| EnrichError::Export {
        path: path.display().to_string(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(|e| export_error(e.into()))?;
    writer
        .write_record(HEADERS)
        .map_err(|e| export_error(e.into()))?;
    for row in rows {
        writer
            .write_record(row_cells(row))
            .map_err(|e| export_error(e.into()))?;
    }
    writer.flush().map_err(export_error)
}
