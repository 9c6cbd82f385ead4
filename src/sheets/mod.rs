//! Spreadsheet output. Each named sheet is written as its own workbook file.

use crate::storage::{Cell, Table};
use anyhow::{Context, Result};
use rust_xlsxwriter::Workbook;
use std::path::PathBuf;
use tracing::{info, warn};

/// Destination for a header + data block under a sheet name.
pub trait SheetSink {
    /// Replace the sheet's contents: header at A1, data from A2.
    fn write_table(&mut self, sheet: &str, table: &Table) -> Result<()>;
}

/// Writes `<dir>/<sheet>.xlsx` holding a single worksheet named `sheet`.
pub struct XlsxWorkbook {
    dir: PathBuf,
}

impl XlsxWorkbook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, sheet: &str) -> PathBuf {
        self.dir.join(format!("{}.xlsx", sheet))
    }
}

impl SheetSink for XlsxWorkbook {
    fn write_table(&mut self, sheet: &str, table: &Table) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create dir {:?}", self.dir))?;

        let mut workbook = Workbook::new();
        let ws = workbook.add_worksheet();
        ws.set_name(sheet)
            .with_context(|| format!("Invalid sheet name {:?}", sheet))?;

        for (col, name) in table.columns.iter().enumerate() {
            ws.write_string(0, col as u16, name)?;
        }

        for (r, row) in table.rows.iter().enumerate() {
            let r = (r + 1) as u32;
            for (col, cell) in row.iter().enumerate() {
                let col = col as u16;
                match cell {
                    Cell::Empty => {}
                    Cell::Number(n) => {
                        ws.write_number(r, col, *n)?;
                    }
                    Cell::Text(s) => {
                        ws.write_string(r, col, s)?;
                    }
                }
            }
        }

        let path = self.path_for(sheet);
        workbook
            .save(&path)
            .with_context(|| format!("Failed to save {:?}", path))?;
        info!("Sheet {} updated with {} rows ({:?})", sheet, table.rows.len(), path);
        Ok(())
    }
}

/// Push a table to the sink, downgrading failure to a warning.
pub fn publish(sink: &mut dyn SheetSink, sheet: &str, table: &Table) -> bool {
    match sink.write_table(sheet, table) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to update sheet {}: {:#}", sheet, e);
            false
        }
    }
}

/// Keeps the last table written per sheet; clones share storage.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemorySheets {
    pub sheets: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<String, Table>>>,
}

#[cfg(test)]
impl MemorySheets {
    pub fn get(&self, sheet: &str) -> Option<Table> {
        self.sheets.lock().unwrap().get(sheet).cloned()
    }
}

#[cfg(test)]
impl SheetSink for MemorySheets {
    fn write_table(&mut self, sheet: &str, table: &Table) -> Result<()> {
        self.sheets.lock().unwrap().insert(sheet.to_string(), table.clone());
        Ok(())
    }
}
