use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::utils::ts_format;

// ── Keyed rows ────────────────────────────────────────────────────────────────

/// A snapshot row identified by ticker, stamped with its fetch time.
pub trait Keyed {
    fn ticker(&self) -> &str;
    fn timestamp(&self) -> Option<DateTime<FixedOffset>>;
    /// Whether the row carries the value the snapshot exists for (e.g. a price).
    fn has_value(&self) -> bool;
    /// Row emitted for a ticker whose every fetch attempt failed.
    fn placeholder(ticker: &str, at: DateTime<FixedOffset>) -> Self;
}

// ── Quote (fast-info) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuoteRecord {
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[serde(rename = "Price", default)]
    pub price: Option<f64>,
    #[serde(rename = "Type", default)]
    pub quote_type: Option<String>,
    #[serde(rename = "Exchange", default)]
    pub exchange: Option<String>,
    #[serde(rename = "Prev Close", default)]
    pub previous_close: Option<f64>,
    #[serde(rename = "Open", default)]
    pub open: Option<f64>,
    #[serde(rename = "High", default)]
    pub day_high: Option<f64>,
    #[serde(rename = "Low", default)]
    pub day_low: Option<f64>,
    #[serde(rename = "Mkt Cap", default)]
    pub market_cap: Option<f64>,
    #[serde(rename = "Vol", default)]
    pub volume: Option<f64>,
    #[serde(rename = "10d Avg Vol", default)]
    pub avg_volume_10d: Option<f64>,
    #[serde(rename = "3m Avg Vol", default)]
    pub avg_volume_3m: Option<f64>,
    #[serde(rename = "Sh", default)]
    pub shares: Option<f64>,
    #[serde(rename = "52w High", default)]
    pub year_high: Option<f64>,
    #[serde(rename = "52w Low", default)]
    pub year_low: Option<f64>,
    #[serde(rename = "52w Chg", default)]
    pub year_change: Option<f64>,
    #[serde(rename = "50d Avg", default)]
    pub fifty_day_avg: Option<f64>,
    #[serde(rename = "200d Avg", default)]
    pub two_hundred_day_avg: Option<f64>,
    #[serde(rename = "Timestamp", default, with = "ts_format")]
    pub timestamp: Option<DateTime<FixedOffset>>,
}

impl QuoteRecord {
    pub const HEADER: [&'static str; 19] = [
        "Ticker", "Price", "Type", "Exchange", "Prev Close", "Open", "High", "Low", "Mkt Cap",
        "Vol", "10d Avg Vol", "3m Avg Vol", "Sh", "52w High", "52w Low", "52w Chg", "50d Avg",
        "200d Avg", "Timestamp",
    ];
}

impl Keyed for QuoteRecord {
    fn ticker(&self) -> &str {
        &self.ticker
    }
    fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
    }
    fn has_value(&self) -> bool {
        self.price.is_some()
    }
    fn placeholder(ticker: &str, at: DateTime<FixedOffset>) -> Self {
        Self {
            ticker: ticker.to_string(),
            timestamp: Some(at),
            ..Default::default()
        }
    }
}

// ── Previous close ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloseRecord {
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[serde(rename = "PreviousClose", default)]
    pub previous_close: Option<f64>,
    #[serde(rename = "Timestamp", default, with = "ts_format")]
    pub timestamp: Option<DateTime<FixedOffset>>,
}

impl Keyed for CloseRecord {
    fn ticker(&self) -> &str {
        &self.ticker
    }
    fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
    }
    fn has_value(&self) -> bool {
        self.previous_close.is_some()
    }
    fn placeholder(ticker: &str, at: DateTime<FixedOffset>) -> Self {
        Self {
            ticker: ticker.to_string(),
            previous_close: None,
            timestamp: Some(at),
        }
    }
}

// ── Failure log ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[serde(rename = "Reason", alias = "Error", default)]
    pub reason: String,
    #[serde(rename = "When", default, with = "ts_format")]
    pub when: Option<DateTime<FixedOffset>>,
}

impl FailureRecord {
    pub fn new(ticker: &str, reason: impl Into<String>, when: DateTime<FixedOffset>) -> Self {
        Self {
            ticker: ticker.to_string(),
            reason: reason.into(),
            when: Some(when),
        }
    }
}

// ── Fundamentals ──────────────────────────────────────────────────────────────

/// Flattened scalar fields of a provider info payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsRow {
    pub ticker: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub fields: BTreeMap<String, Value>,
}

impl MetricsRow {
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set_number(&mut self, key: &str, value: Option<f64>) {
        let v = value
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), v);
    }
}

impl Keyed for MetricsRow {
    fn ticker(&self) -> &str {
        &self.ticker
    }
    fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
    }
    fn has_value(&self) -> bool {
        !self.fields.is_empty()
    }
    fn placeholder(ticker: &str, at: DateTime<FixedOffset>) -> Self {
        Self {
            ticker: ticker.to_string(),
            timestamp: Some(at),
            fields: BTreeMap::new(),
        }
    }
}

/// SEC company identity: ticker, legal name, CIK.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyIdentity {
    #[serde(rename = "CIK")]
    pub cik: String,
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Entry of `company_tickers.json`: `{"0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."}}`
#[derive(Debug, Clone, Deserialize)]
pub struct RawCompanyEntry {
    #[serde(default)]
    pub cik_str: Option<Value>,
    pub ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// A ticker from one of the configured list CSVs.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedTicker {
    pub ticker: String,
    pub name: Option<String>,
}

// ── Intraday history ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MinuteBar {
    #[serde(rename = "Date", with = "ts_format")]
    pub date: Option<DateTime<FixedOffset>>,
    #[serde(rename = "Volume")]
    pub volume: Option<f64>,
    #[serde(rename = "Open")]
    pub open: Option<f64>,
    #[serde(rename = "High")]
    pub high: Option<f64>,
    #[serde(rename = "Low")]
    pub low: Option<f64>,
    #[serde(rename = "Close")]
    pub close: Option<f64>,
    #[serde(rename = "Dividends")]
    pub dividends: f64,
    #[serde(rename = "Stock Splits")]
    pub stock_splits: f64,
}

// ── Industry summary ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndustrySummary {
    pub industry: String,
    pub companies: usize,
    pub total_market_cap: f64,
    pub total_ev: f64,
    pub total_revenue: f64,
    pub total_gross_profit: f64,
    pub total_ebitda: f64,
    pub total_operating_profit: f64,
    pub total_net_income: f64,
    pub total_operating_cf: f64,
    pub total_fcf: f64,
    pub avg_rating: Option<f64>,
    pub total_analysts: f64,
    pub wa_gross_margin: Option<f64>,
    pub wa_ebitda_margin: Option<f64>,
    pub wa_operating_margin: Option<f64>,
    pub wa_net_margin: Option<f64>,
    pub wa_operating_cf_margin: Option<f64>,
    pub wa_fcf_margin: Option<f64>,
    pub wa_pe: Option<f64>,
    pub wa_ev_ebitda: Option<f64>,
    pub hhi: Option<f64>,
    pub cr1: Option<f64>,
    pub cr2: Option<f64>,
    pub cr4: Option<f64>,
    pub cr10: Option<f64>,
}
