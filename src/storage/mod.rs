//! Flat-file storage: typed CSV snapshots, the failure log, and dynamic tables.

pub mod merge;

use crate::models::{FailureRecord, QuoteRecord};
use crate::utils::format_ts;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{info, warn};

// ── Snapshots ─────────────────────────────────────────────────────────────────

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }
    Ok(())
}

/// Read a typed snapshot. Missing file → empty; malformed rows are skipped with a
/// warning, so a snapshot rewritten from the result no longer has them.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(vec![]);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open snapshot {:?}", path))?;

    let mut rows = Vec::new();
    for (i, result) in reader.deserialize().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => warn!(
                "Row {} in {:?} is unreadable and will be dropped on rewrite: {}",
                i + 1,
                path,
                e
            ),
        }
    }
    Ok(rows)
}

pub fn write_snapshot<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    ensure_parent(path)?;
    let mut w = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    for row in rows {
        w.serialize(row)?;
    }
    w.flush()?;
    info!("Saved {} rows to {:?}", rows.len(), path);
    Ok(())
}

/// Copy the current snapshot to `backup` before it is overwritten. No-op if absent.
pub fn archive(path: &Path, backup: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    ensure_parent(backup)?;
    std::fs::copy(path, backup)
        .with_context(|| format!("Failed to archive {:?} to {:?}", path, backup))?;
    info!("Archived {:?} to {:?}", path, backup);
    Ok(true)
}

// ── Failure log ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLogMode {
    /// Replace the log with this run's failures; delete it when there are none.
    Overwrite,
    /// Append to the log, writing the header only for a new file.
    Append,
}

pub fn write_failures(path: &Path, failures: &[FailureRecord], mode: FailureLogMode) -> Result<()> {
    match mode {
        FailureLogMode::Overwrite if failures.is_empty() => {
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {:?}", path))?;
            }
            info!("All tickers recovered, failure log cleared");
            Ok(())
        }
        FailureLogMode::Overwrite => {
            write_snapshot(path, failures)?;
            info!("Logged {} failed tickers to {:?}", failures.len(), path);
            Ok(())
        }
        FailureLogMode::Append if failures.is_empty() => Ok(()),
        FailureLogMode::Append => {
            ensure_parent(path)?;
            let is_new = !path.exists();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {:?}", path))?;
            let mut w = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
            for f in failures {
                w.serialize(f)?;
            }
            w.flush()?;
            info!("Appended {} failed tickers to {:?}", failures.len(), path);
            Ok(())
        }
    }
}

/// Unique tickers from a failure log, in first-seen order.
pub fn read_failed_tickers(path: &Path) -> Result<Vec<String>> {
    let records: Vec<FailureRecord> = read_snapshot(path)?;
    let mut seen = HashSet::new();
    Ok(records
        .into_iter()
        .map(|r| r.ticker)
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect())
}

// ── Dynamic tables ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn number(v: Option<f64>) -> Self {
        match v {
            Some(n) if n.is_finite() => Cell::Number(n),
            _ => Cell::Empty,
        }
    }

    pub fn text(v: Option<&str>) -> Self {
        match v {
            Some(s) => Cell::Text(s.to_string()),
            None => Cell::Empty,
        }
    }

    fn to_field(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Number(n) => n.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }
}

/// Header row + data block, the shape shared by CSV output and spreadsheet sheets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut w = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        w.write_record(&self.columns)?;
        for row in &self.rows {
            w.write_record(row.iter().map(Cell::to_field))?;
        }
        w.flush()?;
        info!("Saved {} rows to {:?}", self.rows.len(), path);
        Ok(())
    }
}

/// Records that render as a fixed-column table row.
pub trait Tabular {
    fn columns() -> Vec<String>;
    fn cells(&self) -> Vec<Cell>;

    fn table(rows: &[Self]) -> Table
    where
        Self: Sized,
    {
        let mut t = Table::new(Self::columns());
        for r in rows {
            t.push(r.cells());
        }
        t
    }
}

impl Tabular for QuoteRecord {
    fn columns() -> Vec<String> {
        QuoteRecord::HEADER.iter().map(|c| c.to_string()).collect()
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(self.ticker.clone()),
            Cell::number(self.price),
            Cell::text(self.quote_type.as_deref()),
            Cell::text(self.exchange.as_deref()),
            Cell::number(self.previous_close),
            Cell::number(self.open),
            Cell::number(self.day_high),
            Cell::number(self.day_low),
            Cell::number(self.market_cap),
            Cell::number(self.volume),
            Cell::number(self.avg_volume_10d),
            Cell::number(self.avg_volume_3m),
            Cell::number(self.shares),
            Cell::number(self.year_high),
            Cell::number(self.year_low),
            Cell::number(self.year_change),
            Cell::number(self.fifty_day_avg),
            Cell::number(self.two_hundred_day_avg),
            Cell::text(self.timestamp.as_ref().map(format_ts).as_deref()),
        ]
    }
}

/// Rows of a CSV file keyed by header, all values kept as text.
pub fn read_rows(path: &Path) -> Result<Vec<std::collections::HashMap<String, String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        match result {
            Ok(rec) => rows.push(
                headers
                    .iter()
                    .zip(rec.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect(),
            ),
            Err(e) => warn!("Row {} in {:?}: {}", i + 1, path, e),
        }
    }
    Ok(rows)
}
