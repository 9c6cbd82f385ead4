//! Snapshot merge: fold freshly fetched rows into the previous run's rows by ticker.

use crate::models::Keyed;
use std::collections::BTreeMap;

/// Collapse duplicate tickers to the most recent row by timestamp.
/// Ties and missing timestamps resolve to the later row in input order.
pub fn dedupe_latest<T: Keyed>(rows: Vec<T>) -> Vec<T> {
    let mut by_ticker: BTreeMap<String, T> = BTreeMap::new();
    for row in rows {
        let replace = match by_ticker.get(row.ticker()) {
            None => true,
            Some(old) => match (old.timestamp(), row.timestamp()) {
                (Some(o), Some(n)) => n >= o,
                (Some(_), None) => false,
                (None, _) => true,
            },
        };
        if replace {
            by_ticker.insert(row.ticker().to_string(), row);
        }
    }
    by_ticker.into_values().collect()
}

/// Whether `fresh` should replace `old` for the same ticker.
///
/// Fresh wins when it carries a value and is not older than the old row.
/// An old row without a timestamp always loses to a fresh row with a value.
pub fn supersedes<T: Keyed>(fresh: &T, old: &T) -> bool {
    if !fresh.has_value() {
        return false;
    }
    match (fresh.timestamp(), old.timestamp()) {
        (_, None) => true,
        (Some(n), Some(o)) => n >= o,
        (None, Some(_)) => false,
    }
}

/// Merge `fresh` into `existing`, keyed by ticker, sorted by ticker.
///
/// Tickers only in `existing` are kept; tickers only in `fresh` are added even
/// when they carry no value (placeholder rows).
pub fn merge_snapshot<T: Keyed>(existing: Vec<T>, fresh: Vec<T>) -> Vec<T> {
    let mut merged: BTreeMap<String, T> = dedupe_latest(existing)
        .into_iter()
        .map(|r| (r.ticker().to_string(), r))
        .collect();

    for row in dedupe_latest(fresh) {
        let take = match merged.get(row.ticker()) {
            None => true,
            Some(old) => supersedes(&row, old),
        };
        if take {
            merged.insert(row.ticker().to_string(), row);
        }
    }

    merged.into_values().collect()
}
