//! Per-ticker fetching: a jittered retry policy, the bounded worker pool, and
//! the doubling-backoff recovery pass for tickers that failed before.

use crate::config::RetryConfig;
use crate::models::{FailureRecord, Keyed};
use crate::provider::FetchError;
use crate::utils::now_eastern;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Bounded attempts with linear jitter: the wait after attempt `n` is
/// `uniform(min, max) * n`, and no wait may push past the elapsed budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub max_wait: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            max_wait: Duration::from_secs(cfg.max_wait_secs),
            backoff_min: Duration::from_millis(cfg.backoff_min_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms.max(cfg.backoff_min_ms)),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let span = self.backoff_max.saturating_sub(self.backoff_min);
        (self.backoff_min + span.mul_f64(rand::random::<f64>())) * attempt
    }

    pub async fn run<T, F, Fut>(&self, ticker: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let start = Instant::now();
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.attempts {
                warn!("{} failed: {} (after {:.1?})", ticker, err, start.elapsed());
                return Err(err);
            }

            let wait = self.backoff(attempt);
            if start.elapsed() + wait > self.max_wait {
                warn!(
                    "{} failed: {} (retry budget of {:?} exhausted)",
                    ticker, err, self.max_wait
                );
                return Err(err);
            }

            debug!("{} retry {} in {:.1?}: {}", ticker, attempt, wait, err);
            sleep(wait).await;
            attempt += 1;
        }
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FetchOutcome<T> {
    pub rows: Vec<T>,
    pub failures: Vec<FailureRecord>,
}

impl<T> Default for FetchOutcome<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T: Keyed> FetchOutcome<T> {
    fn record(&mut self, ticker: &str, result: Result<T, FetchError>) {
        match result {
            Ok(row) => self.rows.push(row),
            Err(e) => self
                .failures
                .push(FailureRecord::new(ticker, e.to_string(), now_eastern())),
        }
    }

    pub fn failed_tickers(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.ticker.clone()).collect()
    }

    pub fn fetched_tickers(&self) -> HashSet<String> {
        self.rows.iter().map(|r| r.ticker().to_string()).collect()
    }

    /// Fold in a second pass over this outcome's failures: its rows are added
    /// and its failures become the remaining ones.
    pub fn absorb(&mut self, retry: FetchOutcome<T>) {
        self.rows.extend(retry.rows);
        self.failures = retry.failures;
    }

    /// Final rows, with a null-valued placeholder per failed ticker, and the failures.
    pub fn finish(self) -> (Vec<T>, Vec<FailureRecord>) {
        let mut rows = self.rows;
        for f in &self.failures {
            rows.push(T::placeholder(&f.ticker, f.when.unwrap_or_else(now_eastern)));
        }
        (rows, self.failures)
    }
}

// ── Worker pool ───────────────────────────────────────────────────────────────

/// Fetch every ticker on at most `concurrency` tasks, retrying each under `policy`.
pub async fn fetch_all<T, F, Fut>(
    tickers: &[String],
    concurrency: usize,
    policy: &RetryPolicy,
    fetch: F,
) -> FetchOutcome<T>
where
    T: Keyed + Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let fetch = Arc::new(fetch);
    let mut handles = Vec::with_capacity(tickers.len());

    for ticker in tickers {
        let ticker = ticker.clone();
        let sem = Arc::clone(&sem);
        let fetch = Arc::clone(&fetch);
        let policy = policy.clone();
        let key = ticker.clone();

        let handle = tokio::spawn(async move {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| FetchError::Batch(e.to_string()))?;
            policy.run(&ticker, || fetch(ticker.clone())).await
        });
        handles.push((key, handle));
    }

    let mut outcome = FetchOutcome::default();
    for (ticker, handle) in handles {
        match handle.await {
            Ok(result) => outcome.record(&ticker, result),
            Err(e) => {
                error!("Task panic for {}: {}", ticker, e);
                outcome.record(&ticker, Err(FetchError::Batch(e.to_string())));
            }
        }
    }

    info!(
        "Fetched: {} | Failed: {} | Total requested: {}",
        outcome.rows.len(),
        outcome.failures.len(),
        tickers.len()
    );
    outcome
}

// ── Recovery pass ─────────────────────────────────────────────────────────────

/// Doubling delays `base, 2·base, 4·base, ...`, one fewer than `attempts`.
fn doubling(base_ms: u64, attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor((base_ms / 2).max(1))
        .take(attempts.saturating_sub(1))
}

/// Retry tickers one at a time with doubling backoff. Unknown symbols are not retried.
pub async fn recover<T, F, Fut>(
    tickers: &[String],
    attempts: usize,
    base_ms: u64,
    fetch: F,
) -> FetchOutcome<T>
where
    T: Keyed,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut outcome = FetchOutcome::default();
    if tickers.is_empty() {
        return outcome;
    }

    info!("Retrying {} previously failed tickers...", tickers.len());
    for ticker in tickers {
        let result = RetryIf::start(
            doubling(base_ms, attempts),
            || fetch(ticker.clone()),
            |e: &FetchError| e.is_retryable(),
        )
        .await;
        if result.is_ok() {
            info!("Recovered {}", ticker);
        }
        outcome.record(ticker, result);
    }

    info!(
        "Recovered {} of {} tickers",
        outcome.rows.len(),
        tickers.len()
    );
    outcome
}
