//! Ticker universe loaders: the SEC company file and plain CSV ticker lists.

use crate::models::ListedTicker;
use crate::provider::cleaner::normalise_symbol;
use crate::provider::sec::parse_company_tickers;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Tickers from `company_tickers.json`, in key order, preceded by `extra`.
/// Duplicates keep their first position.
pub fn load_company_universe(path: &Path, extra: &[String]) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read company file {:?}", path))?;
    let companies = parse_company_tickers(&text)
        .with_context(|| format!("Malformed company file {:?}", path))?;

    let universe = unique_tickers(extra.iter().cloned().chain(companies.into_iter().map(|c| c.ticker)));
    info!("{} tickers in universe from {:?}", universe.len(), path);
    Ok(universe)
}

/// One ticker per line, optional `Ticker` header line. Missing file → empty list.
pub fn load_filtered_tickers(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        warn!("{:?} not found", path);
        return Ok(vec![]);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let lines: Vec<String> = text
        .lines()
        .map(normalise_symbol)
        .filter(|l| !l.is_empty())
        .collect();

    let body = match lines.first() {
        Some(first) if first.starts_with("TICKER") => &lines[1..],
        _ => &lines[..],
    };
    Ok(body.to_vec())
}

/// Read every list CSV that exists and has a `Ticker` column; uppercase, drop duplicates.
pub fn load_ticker_lists(paths: &[impl AsRef<Path>]) -> Result<Vec<ListedTicker>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            warn!("File not found: {:?}", path);
            continue;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        let headers = reader.headers()?.clone();
        let Some(ticker_idx) = headers.iter().position(|h| h.trim() == "Ticker") else {
            warn!("Skipping {:?}: no 'Ticker' column found", path);
            continue;
        };
        let name_idx = headers.iter().position(|h| h.trim() == "Name");

        for (i, result) in reader.records().enumerate() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!("Row {} in {:?}: {}", i + 1, path, e);
                    continue;
                }
            };
            let ticker = record.get(ticker_idx).map(normalise_symbol).unwrap_or_default();
            if ticker.is_empty() || !seen.insert(ticker.clone()) {
                continue;
            }
            let name = name_idx
                .and_then(|i| record.get(i))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            out.push(ListedTicker { ticker, name });
        }
        debug!("{:?}: {} unique tickers so far", path, out.len());
    }

    info!("Combined tickers from all sources: {} unique tickers", out.len());
    Ok(out)
}

/// Uppercase and drop blanks and duplicates, keeping first positions.
pub fn unique_tickers(tickers: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tickers
        .map(|t| normalise_symbol(&t))
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_company_universe_numeric_order_and_extra() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("company_tickers.json");
        fs::write(
            &path,
            r#"{"10": {"cik_str": 3, "ticker": "IBM", "title": "IBM"},
                "2": {"cik_str": 2, "ticker": "msft", "title": "Microsoft"},
                "0": {"cik_str": 1, "ticker": "AAPL", "title": "Apple"},
                "3": {"cik_str": 4, "ticker": "APUS", "title": "Apimeds"}}"#,
        )
        .unwrap();

        let universe = load_company_universe(&path, &["APUS".to_string()]).unwrap();
        assert_eq!(universe, vec!["APUS", "AAPL", "MSFT", "IBM"]);
    }

    #[test]
    fn test_filtered_tickers_header_optional() {
        let dir = tempfile::tempdir().unwrap();
        let with_header = dir.path().join("a.csv");
        fs::write(&with_header, "Ticker\naapl\n\n msft \n").unwrap();
        assert_eq!(load_filtered_tickers(&with_header).unwrap(), vec!["AAPL", "MSFT"]);

        let bare = dir.path().join("b.csv");
        fs::write(&bare, "TSLA\nNVDA\n").unwrap();
        assert_eq!(load_filtered_tickers(&bare).unwrap(), vec!["TSLA", "NVDA"]);

        assert!(load_filtered_tickers(&dir.path().join("missing.csv")).unwrap().is_empty());
    }

    #[test]
    fn test_ticker_lists_dedupe_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("indices.csv");
        fs::write(&a, "Ticker,Name\n^gspc,S&P 500\n^DJI,Dow\n").unwrap();
        let b = dir.path().join("etf.csv");
        fs::write(&b, "Ticker\n^GSPC\nSPY\n").unwrap();
        let c = dir.path().join("bad.csv");
        fs::write(&c, "Symbol\nQQQ\n").unwrap();

        let list = load_ticker_lists(&[a, b, c, dir.path().join("nope.csv")]).unwrap();
        let tickers: Vec<&str> = list.iter().map(|t| t.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["^GSPC", "^DJI", "SPY"]);
        assert_eq!(list[0].name.as_deref(), Some("S&P 500"));
        assert_eq!(list[2].name, None);
    }
}
