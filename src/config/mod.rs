use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub paths: PathsConfig,
    pub sheets: SheetsConfig,
    pub preflight: PreflightConfig,
    pub latest_prices: LatestPricesConfig,
    pub filtered_prices: FilteredPricesConfig,
    pub previous_close: PreviousCloseConfig,
    pub metrics: MetricsConfig,
    pub history: HistoryConfig,
    pub industry: IndustryConfig,
}

/// Data provider (HTTP) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_quote_base_url")]
    pub quote_base_url: String,

    #[serde(default = "default_cookie_url")]
    pub cookie_url: String,

    #[serde(default = "default_sec_tickers_url")]
    pub sec_tickers_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// SEC asks for a contact address in the User-Agent.
    #[serde(default = "default_sec_user_agent")]
    pub sec_user_agent: String,
}

/// File layout, all relative to `root`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    #[serde(default = "default_flags_dir")]
    pub flags_dir: String,
    #[serde(default = "default_locks_dir")]
    pub locks_dir: String,
    #[serde(default = "default_history_dir")]
    pub history_dir: String,
    #[serde(default = "default_company_json")]
    pub company_json: String,
}

/// Spreadsheet output
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SheetsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_workbook_dir")]
    pub workbook_dir: String,
}

/// Rate-limit probe run before a full fetch
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreflightConfig {
    #[serde(default = "default_probe_tickers")]
    pub tickers: Vec<String>,
    #[serde(default = "default_preflight_attempts")]
    pub attempts: u32,
    #[serde(default = "default_preflight_wait_minutes")]
    pub wait_minutes: u64,
}

/// Per-ticker retry settings shared by the fetch jobs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Attempts for previously failed tickers (doubling backoff).
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: usize,
    #[serde(default = "default_recovery_base_ms")]
    pub recovery_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LatestPricesConfig {
    #[serde(default = "default_extra_tickers")]
    pub extra_tickers: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub preflight: bool,
    #[serde(default = "default_true")]
    pub retry_failed_first: bool,
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,
    #[serde(default = "default_latest_sheet")]
    pub sheet: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilteredPricesConfig {
    #[serde(default = "default_extra_tickers")]
    pub extra_tickers: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_tickers")]
    pub max_tickers: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_lock_poll_secs")]
    pub lock_poll_secs: u64,
    /// Lock files older than this are pruned before counting. 0 disables.
    #[serde(default)]
    pub stale_lock_secs: u64,
    #[serde(default = "default_filtered_retry")]
    pub retry: RetryConfig,
    #[serde(default = "default_latest_sheet")]
    pub sheet: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreviousCloseConfig {
    #[serde(default = "default_extra_tickers")]
    pub extra_tickers: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    #[serde(default = "default_batch_failure_pause_ms")]
    pub batch_failure_pause_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Download a fresh `company_tickers.json` before the run.
    #[serde(default = "default_true")]
    pub refresh_sec: bool,
    /// Ticker list CSVs under the source dir; each needs a `Ticker` column.
    #[serde(default = "default_ticker_lists")]
    pub ticker_lists: Vec<String>,
    #[serde(default = "default_metrics_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_true")]
    pub preflight: bool,
    #[serde(default = "default_true")]
    pub recovery_pass: bool,
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,
    #[serde(default = "default_metrics_output")]
    pub output: String,
    #[serde(default = "default_metrics_sheet")]
    pub sheet: String,
    /// Output columns in order (raw names). Empty keeps every column.
    #[serde(default = "default_metrics_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_metrics_rename")]
    pub rename: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_range")]
    pub range: String,
    #[serde(default = "default_history_interval")]
    pub interval: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndustryConfig {
    #[serde(default = "default_industry_input")]
    pub input: String,
    #[serde(default = "default_industry_output")]
    pub output: String,
    #[serde(default = "default_industry_sheet")]
    pub sheet: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_quote_base_url() -> String {
    "https://query1.finance.yahoo.com".to_string()
}
fn default_cookie_url() -> String {
    "https://fc.yahoo.com".to_string()
}
fn default_sec_tickers_url() -> String {
    "https://www.sec.gov/files/company_tickers.json".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    250
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string()
}
fn default_sec_user_agent() -> String {
    "market-etl research (contact@example.com)".to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_source_dir() -> String {
    "Source Data".to_string()
}
fn default_logs_dir() -> String {
    "Logs".to_string()
}
fn default_flags_dir() -> String {
    "Flags".to_string()
}
fn default_locks_dir() -> String {
    "Locks".to_string()
}
fn default_history_dir() -> String {
    "History".to_string()
}
fn default_company_json() -> String {
    "company_tickers.json".to_string()
}
fn default_workbook_dir() -> String {
    "Workbooks".to_string()
}
fn default_true() -> bool {
    true
}
fn default_probe_tickers() -> Vec<String> {
    vec!["AAPL".into(), "MSFT".into(), "APUS".into()]
}
fn default_preflight_attempts() -> u32 {
    3
}
fn default_preflight_wait_minutes() -> u64 {
    15
}
fn default_attempts() -> u32 {
    3
}
fn default_max_wait_secs() -> u64 {
    15
}
fn default_backoff_min_ms() -> u64 {
    1500
}
fn default_backoff_max_ms() -> u64 {
    3500
}
fn default_recovery_attempts() -> usize {
    3
}
fn default_recovery_base_ms() -> u64 {
    500
}
fn default_retry() -> RetryConfig {
    RetryConfig {
        attempts: default_attempts(),
        max_wait_secs: default_max_wait_secs(),
        backoff_min_ms: default_backoff_min_ms(),
        backoff_max_ms: default_backoff_max_ms(),
        recovery_attempts: default_recovery_attempts(),
        recovery_base_ms: default_recovery_base_ms(),
    }
}
fn default_filtered_retry() -> RetryConfig {
    RetryConfig {
        attempts: 1,
        backoff_max_ms: 2500,
        ..default_retry()
    }
}
fn default_extra_tickers() -> Vec<String> {
    vec!["APUS".into()]
}
fn default_concurrency() -> usize {
    5
}
fn default_metrics_concurrency() -> usize {
    1
}
fn default_max_tickers() -> usize {
    500
}
fn default_max_instances() -> usize {
    5
}
fn default_lock_poll_secs() -> u64 {
    3
}
fn default_batch_size() -> usize {
    50
}
fn default_batch_pause_ms() -> u64 {
    1000
}
fn default_batch_failure_pause_ms() -> u64 {
    4000
}
fn default_latest_sheet() -> String {
    "data_LatestPrices".to_string()
}
fn default_ticker_lists() -> Vec<String> {
    vec!["indices_list.csv".into()]
}
fn default_metrics_output() -> String {
    "indices_full_metrics.csv".to_string()
}
fn default_metrics_sheet() -> String {
    "data_indicesFullMetrics".to_string()
}
fn default_metrics_columns() -> Vec<String> {
    [
        "Ticker",
        "IndexName",
        "typeDisp",
        "fullExchangeName",
        "fiftyDayAverageChange",
        "fiftyDayAverageChangePercent",
        "twoHundredDayAverageChange",
        "twoHundredDayAverageChangePercent",
        "firstTradeDateMilliseconds",
        "Timestamp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_metrics_rename() -> BTreeMap<String, String> {
    [
        ("IndexName", "Name"),
        ("typeDisp", "Type"),
        ("fullExchangeName", "Exchange"),
        ("fiftyDayAverageChange", "50d Chg"),
        ("fiftyDayAverageChangePercent", "50d % Chg"),
        ("twoHundredDayAverageChange", "200d Chg"),
        ("twoHundredDayAverageChangePercent", "200d % Chg"),
        ("firstTradeDateMilliseconds", "First Trade"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_history_range() -> String {
    "7d".to_string()
}
fn default_history_interval() -> String {
    "1m".to_string()
}
fn default_industry_sheet() -> String {
    "data_Industries".to_string()
}
fn default_industry_input() -> String {
    "full_metrics.csv".to_string()
}
fn default_industry_output() -> String {
    "industry_summary.csv".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            quote_base_url: default_quote_base_url(),
            cookie_url: default_cookie_url(),
            sec_tickers_url: default_sec_tickers_url(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            user_agent: default_user_agent(),
            sec_user_agent: default_sec_user_agent(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            source_dir: default_source_dir(),
            logs_dir: default_logs_dir(),
            flags_dir: default_flags_dir(),
            locks_dir: default_locks_dir(),
            history_dir: default_history_dir(),
            company_json: default_company_json(),
        }
    }
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workbook_dir: default_workbook_dir(),
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            tickers: default_probe_tickers(),
            attempts: default_preflight_attempts(),
            wait_minutes: default_preflight_wait_minutes(),
        }
    }
}

impl Default for LatestPricesConfig {
    fn default() -> Self {
        Self {
            extra_tickers: default_extra_tickers(),
            concurrency: default_concurrency(),
            preflight: false,
            retry_failed_first: true,
            retry: default_retry(),
            sheet: default_latest_sheet(),
        }
    }
}

impl Default for FilteredPricesConfig {
    fn default() -> Self {
        Self {
            extra_tickers: default_extra_tickers(),
            concurrency: default_concurrency(),
            max_tickers: default_max_tickers(),
            max_instances: default_max_instances(),
            lock_poll_secs: default_lock_poll_secs(),
            stale_lock_secs: 0,
            retry: default_filtered_retry(),
            sheet: default_latest_sheet(),
        }
    }
}

impl Default for PreviousCloseConfig {
    fn default() -> Self {
        Self {
            extra_tickers: default_extra_tickers(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            batch_failure_pause_ms: default_batch_failure_pause_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            refresh_sec: true,
            ticker_lists: default_ticker_lists(),
            concurrency: default_metrics_concurrency(),
            preflight: true,
            recovery_pass: true,
            retry: default_retry(),
            output: default_metrics_output(),
            sheet: default_metrics_sheet(),
            columns: default_metrics_columns(),
            rename: default_metrics_rename(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            range: default_history_range(),
            interval: default_history_interval(),
        }
    }
}

impl Default for IndustryConfig {
    fn default() -> Self {
        Self {
            input: default_industry_input(),
            output: default_industry_output(),
            sheet: default_industry_sheet(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("MARKET").separator("__"))
            .build()?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}

// ── Resolved paths ───────────────────────────────────────────────────────────

impl PathsConfig {
    pub fn source(&self, file: &str) -> PathBuf {
        self.root.join(&self.source_dir).join(file)
    }
    pub fn log(&self, file: &str) -> PathBuf {
        self.root.join(&self.logs_dir).join(file)
    }
    pub fn flags(&self) -> PathBuf {
        self.root.join(&self.flags_dir)
    }
    pub fn locks(&self) -> PathBuf {
        self.root.join(&self.locks_dir)
    }
    pub fn history(&self) -> PathBuf {
        self.root.join(&self.source_dir).join(&self.history_dir)
    }
    pub fn company_json(&self) -> PathBuf {
        self.source(&self.company_json)
    }
}

impl SheetsConfig {
    pub fn workbook_dir(&self, paths: &PathsConfig) -> PathBuf {
        paths.root.join(&self.workbook_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.latest_prices.concurrency, 5);
        assert_eq!(cfg.latest_prices.retry.attempts, 3);
        assert_eq!(cfg.filtered_prices.retry.attempts, 1);
        assert_eq!(cfg.filtered_prices.max_instances, 5);
        assert_eq!(cfg.metrics.concurrency, 1);
        assert_eq!(cfg.previous_close.batch_size, 50);
        assert_eq!(cfg.preflight.tickers, vec!["AAPL", "MSFT", "APUS"]);
        assert_eq!(
            cfg.paths.source("latest_prices.csv"),
            PathBuf::from("./Source Data/latest_prices.csv")
        );
        assert_eq!(cfg.metrics.rename["IndexName"], "Name");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "latest_prices": { "concurrency": 2, "retry": { "attempts": 7 } },
            "paths": { "root": "/data/market" }
        }))
        .unwrap();
        assert_eq!(cfg.latest_prices.concurrency, 2);
        assert_eq!(cfg.latest_prices.retry.attempts, 7);
        assert_eq!(cfg.latest_prices.retry.max_wait_secs, 15);
        assert_eq!(cfg.latest_prices.sheet, "data_LatestPrices");
        assert_eq!(cfg.paths.locks(), PathBuf::from("/data/market/Locks"));
    }
}
