//! Job runners: provider → merge → CSV/sheet → flag.
//!
//! ## Jobs
//!
//! `latest_prices()`: fast quotes for the whole company universe, previous
//!   failures retried first, merged into `latest_prices.csv`.
//!
//! `filtered_prices()`: the same fetch for the short `filtered_tickers.csv`
//!   list, throttled by the instance lock so several can run side by side.
//!
//! `previous_close()`: last 1-minute close per ticker via batched calls.
//!
//! `full_metrics()`: full info payload per listed ticker, joined with the SEC
//!   identity table and written as a column-selected table.
//!
//! `industry_summary()` and `history()` post-process what the jobs above wrote.

pub mod fetch;
pub mod preflight;

use crate::analytics::{self, add_calculated_fields, convert_date_fields, metrics_table};
use crate::config::AppConfig;
use crate::coord::{self, InstanceLock};
use crate::loader::{load_company_universe, load_filtered_tickers, load_ticker_lists, unique_tickers};
use crate::models::{CloseRecord, CompanyIdentity, FailureRecord, IndustrySummary, Keyed, QuoteRecord};
use crate::provider::sec::{SecDirectory, parse_company_tickers, save_company_list};
use crate::provider::{FetchError, MarketDataSource, YahooSource};
use crate::sheets::{self, SheetSink, XlsxWorkbook};
use crate::storage::merge::{dedupe_latest, merge_snapshot};
use crate::storage::{self, FailureLogMode, Table, Tabular};
use crate::utils::now_eastern;
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use self::fetch::{FetchOutcome, RetryPolicy, fetch_all, recover};
use self::preflight::Preflight;

const LATEST_PRICES: &str = "latest_prices.csv";
const OLD_LATEST_PRICES: &str = "old_latest_prices.csv";
const PREVIOUS_CLOSE: &str = "previous_close_prices.csv";
const OLD_PREVIOUS_CLOSE: &str = "previous_previous_close_prices.csv";
const FILTERED_TICKERS: &str = "filtered_tickers.csv";
const SEC_COMPANY_LIST: &str = "sec_company_list.csv";

const LATEST_FAILED: &str = "latest_prices_failed_tickers.csv";
const FILTERED_FAILED: &str = "latest_filtered_failed_tickers.csv";
const PREVIOUS_CLOSE_FAILED: &str = "previous_close_prices_failed_tickers.csv";
const METRICS_FAILED: &str = "full_metrics_failed_tickers.csv";

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub tickers_requested: usize,
    pub fetched: usize,
    pub failed: usize,
    pub rows_written: usize,
}

pub struct Pipeline {
    config: AppConfig,
    source: Arc<dyn MarketDataSource>,
    sheets: Option<Box<dyn SheetSink>>,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        let source = YahooSource::new(&config.provider).context("Failed to build provider client")?;
        let sheets: Option<Box<dyn SheetSink>> = if config.sheets.enabled {
            Some(Box::new(XlsxWorkbook::new(
                config.sheets.workbook_dir(&config.paths),
            )))
        } else {
            None
        };
        Ok(Self::with_parts(config, Arc::new(source), sheets))
    }

    pub fn with_parts(
        config: AppConfig,
        source: Arc<dyn MarketDataSource>,
        sheets: Option<Box<dyn SheetSink>>,
    ) -> Self {
        Self {
            config,
            source,
            sheets,
        }
    }

    fn publish(&mut self, sheet: &str, table: &Table) {
        if let Some(sink) = self.sheets.as_mut() {
            sheets::publish(&mut **sink, sheet, table);
        }
    }

    // ── latest-prices ────────────────────────────────────────────────────────

    pub async fn latest_prices(&mut self) -> Result<PipelineStats> {
        let job = self.config.latest_prices.clone();
        let paths = self.config.paths.clone();

        info!("=== Step 1: Loading ticker universe ===");
        let universe = load_company_universe(&paths.company_json(), &job.extra_tickers)?;

        if job.preflight {
            Preflight::from_config(&self.config.preflight)
                .run(self.source.as_ref())
                .await?;
        }

        let src = Arc::clone(&self.source);
        let fetch = move |t: String| {
            let src = Arc::clone(&src);
            async move { src.fast_quote(&t).await }
        };

        let failed_log = paths.log(LATEST_FAILED);
        let mut outcome = if job.retry_failed_first {
            let previous = previous_failures(&failed_log, &universe)?;
            recover(
                &previous,
                job.retry.recovery_attempts,
                job.retry.recovery_base_ms,
                fetch.clone(),
            )
            .await
        } else {
            FetchOutcome::default()
        };

        info!("=== Step 2: Fetching quotes ({} tickers) ===", universe.len());
        let todo = remaining(&universe, &outcome);
        let main = fetch_all(&todo, job.concurrency, &RetryPolicy::from_config(&job.retry), fetch).await;
        outcome.absorb(main);

        let mut stats = stats_for(&universe, &outcome);
        let (rows, failures) = outcome.finish();
        storage::write_failures(&failed_log, &failures, FailureLogMode::Overwrite)?;

        info!("=== Step 3: Merging with previous snapshot ===");
        let snapshot = paths.source(LATEST_PRICES);
        let existing: Vec<QuoteRecord> = storage::read_snapshot(&snapshot)?;
        storage::archive(&snapshot, &paths.source(OLD_LATEST_PRICES))?;
        let merged = merge_snapshot(existing, rows);
        storage::write_snapshot(&snapshot, &merged)?;
        stats.rows_written = merged.len();

        self.publish(&job.sheet, &QuoteRecord::table(&merged));
        coord::drop_flag(&paths.flags(), &coord::pid_flag("all_prices_done"))?;

        info!(
            "=== Done: {} tickers | {} fetched | {} failed | {} rows saved ===",
            stats.tickers_requested, stats.fetched, stats.failed, stats.rows_written
        );
        Ok(stats)
    }

    // ── filtered-prices ──────────────────────────────────────────────────────

    pub async fn filtered_prices(&mut self) -> Result<PipelineStats> {
        let job = self.config.filtered_prices.clone();
        let paths = self.config.paths.clone();

        let stale = (job.stale_lock_secs > 0).then(|| Duration::from_secs(job.stale_lock_secs));
        let lock = InstanceLock::acquire(
            &paths.locks(),
            job.max_instances,
            Duration::from_secs(job.lock_poll_secs),
            stale,
        )
        .await?;

        let listed = load_filtered_tickers(&paths.source(FILTERED_TICKERS))?;
        let mut universe = unique_tickers(job.extra_tickers.iter().cloned().chain(listed));
        if universe.len() > job.max_tickers {
            warn!(
                "{} tickers requested, capping at {}",
                universe.len(),
                job.max_tickers
            );
            universe.truncate(job.max_tickers);
        }
        if universe.is_empty() {
            warn!("No tickers to fetch");
            return Ok(PipelineStats::default());
        }

        let src = Arc::clone(&self.source);
        let outcome = fetch_all(
            &universe,
            job.concurrency,
            &RetryPolicy::from_config(&job.retry),
            move |t: String| {
                let src = Arc::clone(&src);
                async move { src.fast_quote(&t).await }
            },
        )
        .await;

        let mut stats = stats_for(&universe, &outcome);
        let (rows, failures) = outcome.finish();
        storage::write_failures(&paths.log(FILTERED_FAILED), &failures, FailureLogMode::Append)?;

        let snapshot = paths.source(LATEST_PRICES);
        let existing: Vec<QuoteRecord> = storage::read_snapshot(&snapshot)?;
        let merged = merge_snapshot(existing, rows);
        storage::write_snapshot(&snapshot, &merged)?;
        stats.rows_written = merged.len();

        self.publish(&job.sheet, &QuoteRecord::table(&merged));
        coord::drop_flag(&paths.flags(), &coord::pid_flag("filtered_prices_done"))?;
        info!("Releasing instance lock {:?}", lock.path());
        Ok(stats)
    }

    // ── previous-close ───────────────────────────────────────────────────────

    pub async fn previous_close(&mut self) -> Result<PipelineStats> {
        let job = self.config.previous_close.clone();
        let paths = self.config.paths.clone();

        let universe = load_company_universe(&paths.company_json(), &job.extra_tickers)?;
        let batches: Vec<&[String]> = universe.chunks(job.batch_size.max(1)).collect();
        info!("Fetching previous closes for {} tickers in {} batches", universe.len(), batches.len());

        let mut rows = Vec::with_capacity(universe.len());
        let mut failures = Vec::new();

        for (i, batch) in batches.iter().enumerate() {
            let now = now_eastern();
            let closes = match self.source.last_closes(batch).await {
                Ok(closes) => closes,
                Err(e) => {
                    warn!("Batch {} fetch failed: {}", i + 1, e);
                    let reason = FetchError::Batch(e.to_string()).to_string();
                    for t in batch.iter() {
                        failures.push(FailureRecord::new(t, reason.clone(), now));
                        rows.push(CloseRecord::placeholder(t, now));
                    }
                    sleep(Duration::from_millis(job.batch_failure_pause_ms)).await;
                    continue;
                }
            };

            for t in batch.iter() {
                match closes.get(t) {
                    Some(Some(price)) => rows.push(CloseRecord {
                        ticker: t.clone(),
                        previous_close: Some(*price),
                        timestamp: Some(now),
                    }),
                    found => {
                        let reason = match found {
                            None => "Ticker missing from batch data",
                            Some(_) => "No close prices returned",
                        };
                        failures.push(FailureRecord::new(t, reason, now));
                        rows.push(CloseRecord::placeholder(t, now));
                    }
                }
            }

            if i + 1 < batches.len() {
                sleep(Duration::from_millis(job.batch_pause_ms)).await;
            }
        }

        let snapshot = paths.source(PREVIOUS_CLOSE);
        let existing: Vec<CloseRecord> = storage::read_snapshot(&snapshot)?;
        storage::archive(&snapshot, &paths.source(OLD_PREVIOUS_CLOSE))?;
        let merged = merge_snapshot(existing, rows);
        storage::write_snapshot(&snapshot, &merged)?;

        storage::write_failures(&paths.log(PREVIOUS_CLOSE_FAILED), &failures, FailureLogMode::Append)?;
        coord::drop_flag(&paths.flags(), &coord::pid_flag("previous_close_prices_done"))?;

        Ok(PipelineStats {
            tickers_requested: universe.len(),
            fetched: universe.len() - failures.len(),
            failed: failures.len(),
            rows_written: merged.len(),
        })
    }

    // ── full-metrics ─────────────────────────────────────────────────────────

    pub async fn full_metrics(&mut self) -> Result<PipelineStats> {
        let job = self.config.metrics.clone();
        let paths = self.config.paths.clone();

        info!("=== Step 1: SEC company directory ===");
        let identities = self.company_identities(job.refresh_sec).await?;

        let lists: Vec<PathBuf> = job.ticker_lists.iter().map(|f| paths.source(f)).collect();
        let listed = load_ticker_lists(&lists)?;
        if listed.is_empty() {
            bail!("No tickers found in {:?}", lists);
        }
        let universe: Vec<String> = listed.iter().map(|l| l.ticker.clone()).collect();
        let list_names: HashMap<String, String> = listed
            .into_iter()
            .filter_map(|l| Some((l.ticker, l.name?)))
            .collect();

        let src = Arc::clone(&self.source);
        let fetch = move |t: String| {
            let src = Arc::clone(&src);
            async move { src.info(&t).await }
        };

        let failed_log = paths.log(METRICS_FAILED);
        let previous = previous_failures(&failed_log, &universe)?;
        let mut outcome = recover(
            &previous,
            job.retry.recovery_attempts,
            job.retry.recovery_base_ms,
            fetch.clone(),
        )
        .await;

        if job.preflight {
            Preflight::from_config(&self.config.preflight)
                .run(self.source.as_ref())
                .await?;
        }

        info!("=== Step 2: Fetching info ({} tickers) ===", universe.len());
        let todo = remaining(&universe, &outcome);
        let mut main = fetch_all(&todo, job.concurrency, &RetryPolicy::from_config(&job.retry), fetch.clone()).await;
        if job.recovery_pass && !main.failures.is_empty() {
            let retry = recover(
                &main.failed_tickers(),
                job.retry.recovery_attempts,
                job.retry.recovery_base_ms,
                fetch,
            )
            .await;
            main.absorb(retry);
        }
        outcome.absorb(main);

        let mut stats = stats_for(&universe, &outcome);
        let (rows, failures) = outcome.finish();
        storage::write_failures(&failed_log, &failures, FailureLogMode::Overwrite)?;

        info!("=== Step 3: Building metrics table ===");
        let mut rows = dedupe_latest(rows);
        for row in &mut rows {
            if let Some(id) = identities.get(&row.ticker) {
                row.fields.insert("Name".into(), Value::String(id.name.clone()));
                row.fields.insert("CIK".into(), Value::String(id.cik.clone()));
            }
            if let Some(name) = list_names.get(&row.ticker) {
                row.fields.insert("IndexName".into(), Value::String(name.clone()));
            }
            convert_date_fields(row);
            add_calculated_fields(row);
        }

        let table = metrics_table(&rows, &job.columns, &job.rename);
        table.write_csv(&paths.source(&job.output))?;
        stats.rows_written = table.rows.len();

        self.publish(&job.sheet, &table);
        coord::drop_flag(&paths.flags(), "full_metrics.flag")?;

        info!(
            "=== Done: {} tickers | {} fetched | {} failed ===",
            stats.tickers_requested, stats.fetched, stats.failed
        );
        Ok(stats)
    }

    /// Identity table keyed by ticker, from a fresh download or the cached JSON.
    async fn company_identities(&self, refresh: bool) -> Result<HashMap<String, CompanyIdentity>> {
        let paths = &self.config.paths;
        let json = paths.company_json();

        let companies = if refresh {
            let sec = SecDirectory::new(&self.config.provider)?;
            match sec.refresh(&json).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("SEC download failed, falling back to {:?}: {:#}", json, e);
                    cached_companies(&json)?
                }
            }
        } else {
            cached_companies(&json)?
        };

        if !companies.is_empty() {
            save_company_list(&paths.source(SEC_COMPANY_LIST), &companies)?;
        }
        Ok(companies.into_iter().map(|c| (c.ticker.clone(), c)).collect())
    }

    // ── industry-summary ─────────────────────────────────────────────────────

    pub fn industry_summary(&mut self) -> Result<PipelineStats> {
        let job = self.config.industry.clone();
        let input = self.config.paths.source(&job.input);

        let rows = storage::read_rows(&input)
            .with_context(|| format!("Cannot read metrics from {:?}", input))?;
        let summary = analytics::industry_summary(&rows);
        info!("{} industries from {} companies", summary.len(), rows.len());

        let table = IndustrySummary::table(&summary);
        table.write_csv(&self.config.paths.source(&job.output))?;
        self.publish(&job.sheet, &table);

        Ok(PipelineStats {
            tickers_requested: rows.len(),
            fetched: rows.len(),
            failed: 0,
            rows_written: summary.len(),
        })
    }

    // ── history ──────────────────────────────────────────────────────────────

    pub async fn history(&mut self) -> Result<PipelineStats> {
        let cfg = self.config.history.clone();
        let paths = self.config.paths.clone();

        let quotes: Vec<QuoteRecord> = storage::read_snapshot(&paths.source(LATEST_PRICES))?;
        let tickers = unique_tickers(quotes.into_iter().map(|q| q.ticker));
        let dir = paths.history();

        let mut stats = PipelineStats {
            tickers_requested: tickers.len(),
            ..Default::default()
        };

        for ticker in &tickers {
            match self
                .source
                .intraday_history(ticker, &cfg.range, &cfg.interval)
                .await
            {
                Ok(bars) => {
                    let file = dir.join(format!("{}_history.csv", ticker.replace('/', "_")));
                    storage::write_snapshot(&file, &bars)?;
                    stats.fetched += 1;
                    stats.rows_written += bars.len();
                }
                Err(e) => {
                    warn!("{}: history fetch failed: {}", ticker, e);
                    stats.failed += 1;
                }
            }
        }

        info!(
            "History: {} saved | {} failed | {} bars",
            stats.fetched, stats.failed, stats.rows_written
        );
        Ok(stats)
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StatusReport {
    /// File name → row count (`None` when the file does not exist).
    pub snapshots: Vec<(String, Option<usize>)>,
    /// File name → unique failed tickers.
    pub failure_logs: Vec<(String, usize)>,
    pub active_locks: usize,
    pub flags: Vec<String>,
}

pub fn status(config: &AppConfig) -> Result<StatusReport> {
    let paths = &config.paths;

    let mut snapshots = Vec::new();
    for file in [
        LATEST_PRICES,
        PREVIOUS_CLOSE,
        config.metrics.output.as_str(),
        config.industry.output.as_str(),
    ] {
        let path = paths.source(file);
        let count = if path.exists() {
            Some(storage::read_rows(&path)?.len())
        } else {
            None
        };
        snapshots.push((file.to_string(), count));
    }

    let mut failure_logs = Vec::new();
    for file in [LATEST_FAILED, FILTERED_FAILED, PREVIOUS_CLOSE_FAILED, METRICS_FAILED] {
        let path = paths.log(file);
        if path.exists() {
            failure_logs.push((file.to_string(), storage::read_failed_tickers(&path)?.len()));
        }
    }

    Ok(StatusReport {
        snapshots,
        failure_logs,
        active_locks: coord::active_count(&paths.locks())?,
        flags: coord::list_flags(&paths.flags())?,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Previously failed tickers that are still part of the universe.
fn previous_failures(log: &Path, universe: &[String]) -> Result<Vec<String>> {
    let wanted: HashSet<&str> = universe.iter().map(String::as_str).collect();
    Ok(storage::read_failed_tickers(log)?
        .into_iter()
        .filter(|t| wanted.contains(t.as_str()))
        .collect())
}

/// Universe minus the tickers an earlier pass already fetched.
fn remaining<T: Keyed>(universe: &[String], outcome: &FetchOutcome<T>) -> Vec<String> {
    let done = outcome.fetched_tickers();
    universe
        .iter()
        .filter(|t| !done.contains(t.as_str()))
        .cloned()
        .collect()
}

fn stats_for<T>(universe: &[String], outcome: &FetchOutcome<T>) -> PipelineStats {
    PipelineStats {
        tickers_requested: universe.len(),
        fetched: outcome.rows.len(),
        failed: outcome.failures.len(),
        rows_written: 0,
    }
}

fn cached_companies(json: &Path) -> Result<Vec<CompanyIdentity>> {
    if !json.exists() {
        warn!("{:?} not found, continuing without company identities", json);
        return Ok(vec![]);
    }
    let body = std::fs::read_to_string(json).with_context(|| format!("Failed to read {:?}", json))?;
    parse_company_tickers(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::{MetricsRow, MinuteBar};
    use crate::sheets::MemorySheets;
    use crate::utils::parse_ts;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockSource {
        prices: HashMap<String, f64>,
        info: HashMap<String, Vec<(&'static str, Value)>>,
        no_close: HashSet<String>,
        broken_batch: Option<String>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl MockSource {
        fn with_prices(pairs: &[(&str, f64)]) -> Self {
            Self {
                prices: pairs.iter().map(|(t, p)| (t.to_string(), *p)).collect(),
                ..Default::default()
            }
        }

        fn hit(&self, ticker: &str) {
            *self.calls.lock().unwrap().entry(ticker.to_string()).or_default() += 1;
        }

        fn calls(&self, ticker: &str) -> usize {
            self.calls.lock().unwrap().get(ticker).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl MarketDataSource for MockSource {
        async fn fast_quote(&self, ticker: &str) -> Result<QuoteRecord, FetchError> {
            self.hit(ticker);
            let price = self
                .prices
                .get(ticker)
                .ok_or_else(|| FetchError::Empty("No price data".into()))?;
            Ok(QuoteRecord {
                ticker: ticker.to_string(),
                price: Some(*price),
                timestamp: Some(now_eastern()),
                ..Default::default()
            })
        }

        async fn info(&self, ticker: &str) -> Result<MetricsRow, FetchError> {
            self.hit(ticker);
            let fields = self.info.get(ticker).ok_or(FetchError::RateLimited(429))?;
            let mut row = MetricsRow::placeholder(ticker, now_eastern());
            for (k, v) in fields {
                row.fields.insert(k.to_string(), v.clone());
            }
            Ok(row)
        }

        async fn last_closes(
            &self,
            tickers: &[String],
        ) -> Result<HashMap<String, Option<f64>>, FetchError> {
            if tickers.iter().any(|t| Some(t) == self.broken_batch.as_ref()) {
                return Err(FetchError::Http(500));
            }
            let mut out = HashMap::new();
            for t in tickers {
                if self.no_close.contains(t) {
                    out.insert(t.clone(), None);
                } else if let Some(p) = self.prices.get(t) {
                    out.insert(t.clone(), Some(*p));
                }
            }
            Ok(out)
        }

        async fn intraday_history(
            &self,
            ticker: &str,
            _range: &str,
            _interval: &str,
        ) -> Result<Vec<MinuteBar>, FetchError> {
            let close = self
                .prices
                .get(ticker)
                .ok_or_else(|| FetchError::NotFound(ticker.into()))?;
            Ok((0..2)
                .map(|i| MinuteBar {
                    date: parse_ts(&format!("2024-06-03 09:3{}:00", i)),
                    volume: Some(100.0),
                    open: Some(*close),
                    high: Some(*close),
                    low: Some(*close),
                    close: Some(*close),
                    dividends: 0.0,
                    stock_splits: 0.0,
                })
                .collect())
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        let quick = RetryConfig {
            attempts: 2,
            max_wait_secs: 5,
            backoff_min_ms: 1,
            backoff_max_ms: 2,
            recovery_attempts: 2,
            recovery_base_ms: 2,
        };
        let mut cfg = AppConfig::default();
        cfg.paths.root = root.to_path_buf();
        cfg.latest_prices.retry = quick.clone();
        cfg.filtered_prices.retry = quick.clone();
        cfg.metrics.retry = quick;
        cfg.metrics.preflight = false;
        cfg.metrics.refresh_sec = false;
        cfg.previous_close.batch_pause_ms = 0;
        cfg.previous_close.batch_failure_pause_ms = 0;
        cfg
    }

    fn write_companies(cfg: &AppConfig, tickers: &[&str]) {
        let body: serde_json::Map<String, Value> = tickers
            .iter()
            .enumerate()
            .map(|(i, t)| {
                (
                    i.to_string(),
                    serde_json::json!({"cik_str": 1000 + i, "ticker": t, "title": format!("{} Inc.", t)}),
                )
            })
            .collect();
        let path = cfg.paths.company_json();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, Value::Object(body).to_string()).unwrap();
    }

    fn pipeline(cfg: AppConfig, mock: &Arc<MockSource>, sheets: &MemorySheets) -> Pipeline {
        let source: Arc<dyn MarketDataSource> = mock.clone();
        Pipeline::with_parts(cfg, source, Some(Box::new(sheets.clone())))
    }

    fn quote(ticker: &str, price: f64, ts: &str) -> QuoteRecord {
        QuoteRecord {
            ticker: ticker.into(),
            price: Some(price),
            timestamp: parse_ts(ts),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_latest_prices_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_companies(&cfg, &["AAPL", "MSFT", "DEAD"]);

        let snapshot = cfg.paths.source(LATEST_PRICES);
        storage::write_snapshot(
            &snapshot,
            &[
                quote("MSFT", 400.0, "2024-06-01 10:00:00"),
                quote("DEAD", 1.0, "2024-06-01 10:00:00"),
            ],
        )
        .unwrap();
        storage::write_failures(
            &cfg.paths.log(LATEST_FAILED),
            &[FailureRecord::new("AAPL", "No price data", now_eastern())],
            FailureLogMode::Overwrite,
        )
        .unwrap();

        let mock = Arc::new(MockSource::with_prices(&[("APUS", 5.0), ("AAPL", 190.0), ("MSFT", 410.0)]));
        let sheets = MemorySheets::default();
        let mut p = pipeline(cfg.clone(), &mock, &sheets);
        let stats = p.latest_prices().await.unwrap();

        assert_eq!(stats.tickers_requested, 4);
        assert_eq!(stats.failed, 1);
        // recovered first, not fetched again
        assert_eq!(mock.calls("AAPL"), 1);
        assert_eq!(mock.calls("DEAD"), 2);

        let rows: Vec<QuoteRecord> = storage::read_snapshot(&snapshot).unwrap();
        let tickers: Vec<&str> = rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "APUS", "DEAD", "MSFT"]);
        assert_eq!(rows[2].price, Some(1.0));
        assert_eq!(rows[3].price, Some(410.0));

        let old: Vec<QuoteRecord> = storage::read_snapshot(&cfg.paths.source(OLD_LATEST_PRICES)).unwrap();
        assert_eq!(old[0].price, Some(400.0));

        assert_eq!(
            storage::read_failed_tickers(&cfg.paths.log(LATEST_FAILED)).unwrap(),
            vec!["DEAD"]
        );
        assert_eq!(sheets.get("data_LatestPrices").unwrap().rows.len(), 4);
        let flags = coord::list_flags(&cfg.paths.flags()).unwrap();
        assert!(flags[0].starts_with("all_prices_done_"));
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_row_survives_only_in_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.latest_prices.extra_tickers = vec![];
        write_companies(&cfg, &["AAPL"]);

        let snapshot = cfg.paths.source(LATEST_PRICES);
        storage::write_snapshot(&snapshot, &[quote("MSFT", 400.0, "2024-06-01 10:00:00")]).unwrap();
        let mut text = std::fs::read_to_string(&snapshot).unwrap();
        text.push_str("GARB,not-a-price\n");
        std::fs::write(&snapshot, text).unwrap();

        let mock = Arc::new(MockSource::with_prices(&[("AAPL", 190.0)]));
        let sheets = MemorySheets::default();
        pipeline(cfg.clone(), &mock, &sheets).latest_prices().await.unwrap();

        let rows: Vec<QuoteRecord> = storage::read_snapshot(&snapshot).unwrap();
        let tickers: Vec<&str> = rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT"]);

        let archived = std::fs::read_to_string(cfg.paths.source(OLD_LATEST_PRICES)).unwrap();
        assert!(archived.contains("GARB,not-a-price"));
    }

    #[tokio::test]
    async fn test_filtered_prices_appends_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.filtered_prices.extra_tickers = vec![];
        cfg.filtered_prices.max_tickers = 2;
        std::fs::create_dir_all(cfg.paths.source("")).unwrap();
        std::fs::write(cfg.paths.source(FILTERED_TICKERS), "Ticker\ndead\naapl\nmsft\n").unwrap();

        let log = cfg.paths.log(FILTERED_FAILED);
        storage::write_failures(
            &log,
            &[FailureRecord::new("OLD", "x", now_eastern())],
            FailureLogMode::Append,
        )
        .unwrap();

        let mock = Arc::new(MockSource::with_prices(&[("AAPL", 190.0), ("MSFT", 410.0)]));
        let sheets = MemorySheets::default();
        let stats = pipeline(cfg.clone(), &mock, &sheets).filtered_prices().await.unwrap();

        assert_eq!(stats.tickers_requested, 2);
        assert_eq!(mock.calls("MSFT"), 0);
        assert_eq!(storage::read_failed_tickers(&log).unwrap(), vec!["OLD", "DEAD"]);
        assert_eq!(coord::active_count(&cfg.paths.locks()).unwrap(), 0);

        let rows: Vec<QuoteRecord> = storage::read_snapshot(&cfg.paths.source(LATEST_PRICES)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ticker, "AAPL");
        assert_eq!(rows[1].price, None);
    }

    #[tokio::test]
    async fn test_previous_close_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.previous_close.extra_tickers = vec![];
        cfg.previous_close.batch_size = 2;
        write_companies(&cfg, &["AAPL", "DEAD", "NOCL", "MSFT", "BRKN", "XYZ"]);

        let mut mock = MockSource::with_prices(&[("AAPL", 190.0), ("MSFT", 410.0), ("XYZ", 1.0)]);
        mock.no_close.insert("NOCL".into());
        mock.broken_batch = Some("BRKN".into());
        let mock = Arc::new(mock);

        let sheets = MemorySheets::default();
        let stats = pipeline(cfg.clone(), &mock, &sheets).previous_close().await.unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.failed, 4);

        let rows: Vec<CloseRecord> = storage::read_snapshot(&cfg.paths.source(PREVIOUS_CLOSE)).unwrap();
        assert_eq!(rows.len(), 6);
        let aapl = rows.iter().find(|r| r.ticker == "AAPL").unwrap();
        assert_eq!(aapl.previous_close, Some(190.0));
        let xyz = rows.iter().find(|r| r.ticker == "XYZ").unwrap();
        assert_eq!(xyz.previous_close, None);

        let failures: Vec<FailureRecord> =
            storage::read_snapshot(&cfg.paths.log(PREVIOUS_CLOSE_FAILED)).unwrap();
        let reason = |t: &str| failures.iter().find(|f| f.ticker == t).unwrap().reason.clone();
        assert_eq!(reason("DEAD"), "Ticker missing from batch data");
        assert_eq!(reason("NOCL"), "No close prices returned");
        assert!(reason("BRKN").starts_with("batch fetch failed"));
        assert!(reason("XYZ").starts_with("batch fetch failed"));
    }

    #[tokio::test]
    async fn test_full_metrics_table_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_companies(&cfg, &["AAPL"]);
        std::fs::write(
            cfg.paths.source("indices_list.csv"),
            "Ticker,Name\n^gspc,S&P 500\n^DJI,Dow Jones\n^BAD,Broken\n",
        )
        .unwrap();

        let mut mock = MockSource::default();
        mock.info.insert(
            "^GSPC".into(),
            vec![
                ("typeDisp", Value::from("Index")),
                ("fullExchangeName", Value::from("SNP")),
                ("fiftyDayAverageChange", Value::from(12.5)),
            ],
        );
        mock.info.insert("^DJI".into(), vec![("typeDisp", Value::from("Index"))]);
        let mock = Arc::new(mock);

        let sheets = MemorySheets::default();
        let stats = pipeline(cfg.clone(), &mock, &sheets).full_metrics().await.unwrap();
        assert_eq!(stats.failed, 1);
        // main pass plus the recovery pass
        assert_eq!(mock.calls("^BAD"), 4);

        let rows = storage::read_rows(&cfg.paths.source("indices_full_metrics.csv")).unwrap();
        assert_eq!(rows.len(), 3);
        let gspc = rows.iter().find(|r| r["Ticker"] == "^GSPC").unwrap();
        assert_eq!(gspc["Name"], "S&P 500");
        assert_eq!(gspc["Type"], "Index");
        assert_eq!(gspc["Exchange"], "SNP");
        assert_eq!(gspc["50d Chg"], "12.5");

        let table = sheets.get("data_indicesFullMetrics").unwrap();
        assert_eq!(table.columns, vec!["Ticker", "Name", "Type", "Exchange", "50d Chg", "Timestamp"]);

        assert_eq!(
            storage::read_failed_tickers(&cfg.paths.log(METRICS_FAILED)).unwrap(),
            vec!["^BAD"]
        );
        assert!(cfg.paths.flags().join("full_metrics.flag").exists());
        assert!(cfg.paths.source(SEC_COMPANY_LIST).exists());
    }

    #[test]
    fn test_industry_summary_job() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        std::fs::create_dir_all(cfg.paths.source("")).unwrap();
        std::fs::write(
            cfg.paths.source("full_metrics.csv"),
            "Ticker,Industry,Mkt Cap\nA,Banks,60\nB,Banks,40\nC,,500\n",
        )
        .unwrap();

        let mock = Arc::new(MockSource::default());
        let sheets = MemorySheets::default();
        let stats = pipeline(cfg.clone(), &mock, &sheets).industry_summary().unwrap();
        assert_eq!(stats.rows_written, 2);

        let rows = storage::read_rows(&cfg.paths.source("industry_summary.csv")).unwrap();
        assert_eq!(rows[0]["Industry"], "none");
        assert_eq!(rows[1]["# of Companies"], "2");
        assert!(sheets.get("data_Industries").is_some());
    }

    #[tokio::test]
    async fn test_history_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        storage::write_snapshot(
            &cfg.paths.source(LATEST_PRICES),
            &[
                quote("AAPL", 190.0, "2024-06-01 10:00:00"),
                quote("ZZZ", 1.0, "2024-06-01 10:00:00"),
            ],
        )
        .unwrap();

        let mock = Arc::new(MockSource::with_prices(&[("AAPL", 190.0)]));
        let sheets = MemorySheets::default();
        let stats = pipeline(cfg.clone(), &mock, &sheets).history().await.unwrap();
        assert_eq!((stats.fetched, stats.failed, stats.rows_written), (1, 1, 2));

        let file = cfg.paths.history().join("AAPL_history.csv");
        let text = std::fs::read_to_string(file).unwrap();
        assert!(text.starts_with("Date,Volume,Open,High,Low,Close,Dividends,Stock Splits\n"));
        assert!(!cfg.paths.history().join("ZZZ_history.csv").exists());

        let _lock = InstanceLock::try_acquire(&cfg.paths.locks(), 5, 1).unwrap().unwrap();
        let report = status(&cfg).unwrap();
        assert_eq!(report.snapshots[0], (LATEST_PRICES.to_string(), Some(2)));
        assert_eq!(report.snapshots[1], (PREVIOUS_CLOSE.to_string(), None));
        assert_eq!(report.active_locks, 1);
        assert!(report.flags.is_empty());
    }
}
