use crate::config::PreflightConfig;
use crate::models::Keyed;
use crate::provider::MarketDataSource;
use anyhow::{Result, bail};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Rate-limit probe run before a full fetch.
pub struct Preflight {
    tickers: Vec<String>,
    attempts: u32,
    wait: Duration,
}

impl Preflight {
    pub fn from_config(cfg: &PreflightConfig) -> Self {
        Self {
            tickers: cfg.tickers.clone(),
            attempts: cfg.attempts.max(1),
            wait: Duration::from_secs(cfg.wait_minutes * 60),
        }
    }

    /// Probe each ticker with an info fetch. One non-empty answer is enough to
    /// proceed; when every probe fails, wait and try again, then give up.
    pub async fn run(&self, source: &dyn MarketDataSource) -> Result<()> {
        for attempt in 1..=self.attempts {
            info!("Pre-flight attempt {} for tickers: {:?}", attempt, self.tickers);

            for ticker in &self.tickers {
                match source.info(ticker).await {
                    Ok(row) if row.has_value() => {
                        info!("{} fetch successful. Proceeding with full fetch.", ticker);
                        return Ok(());
                    }
                    Ok(_) => warn!("{} fetch failed: empty response (possible rate limit)", ticker),
                    Err(e) => warn!("{} fetch failed: {}", ticker, e),
                }
            }

            if attempt < self.attempts {
                warn!(
                    "All probes failed. Waiting {:?} before retrying pre-flight test...",
                    self.wait
                );
                countdown(self.wait).await;
            }
        }
        bail!(
            "Pre-flight failed: every probe ticker failed on all {} attempts",
            self.attempts
        )
    }
}

/// Sleep for `total`, logging the time left once a minute.
async fn countdown(total: Duration) {
    let step = Duration::from_secs(60);
    let mut remaining = total;
    while !remaining.is_zero() {
        let secs = remaining.as_secs();
        info!("Retrying in {:02}:{:02}...", secs / 60, secs % 60);
        let chunk = remaining.min(step);
        sleep(chunk).await;
        remaining -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricsRow, MinuteBar, QuoteRecord};
    use crate::provider::FetchError;
    use crate::utils::now_eastern;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `info` only for `good`, after `outage` failed calls.
    struct Probe {
        good: &'static str,
        outage: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataSource for Probe {
        async fn fast_quote(&self, t: &str) -> Result<QuoteRecord, FetchError> {
            Err(FetchError::NotFound(t.into()))
        }

        async fn info(&self, ticker: &str) -> Result<MetricsRow, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.outage || ticker != self.good {
                return Err(FetchError::RateLimited(429));
            }
            let mut row = MetricsRow::placeholder(ticker, now_eastern());
            row.set_number("regularMarketPrice", Some(1.0));
            Ok(row)
        }

        async fn last_closes(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Option<f64>>, FetchError> {
            Ok(HashMap::new())
        }

        async fn intraday_history(&self, _: &str, _: &str, _: &str) -> Result<Vec<MinuteBar>, FetchError> {
            Ok(vec![])
        }
    }

    fn preflight(attempts: u32) -> Preflight {
        Preflight {
            tickers: vec!["AAPL".into(), "MSFT".into(), "APUS".into()],
            attempts,
            wait: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_any_success_proceeds() {
        let src = Probe { good: "MSFT", outage: 0, calls: AtomicUsize::new(0) };
        tokio_test::block_on(preflight(3).run(&src)).unwrap();
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waits_then_recovers() {
        let src = Probe { good: "AAPL", outage: 3, calls: AtomicUsize::new(0) };
        preflight(3).run(&src).await.unwrap();
        assert_eq!(src.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_aborts_after_last_attempt() {
        let src = Probe { good: "NONE", outage: 0, calls: AtomicUsize::new(0) };
        let err = preflight(2).run(&src).await.unwrap_err();
        assert!(err.to_string().contains("Pre-flight failed"));
        assert_eq!(src.calls.load(Ordering::SeqCst), 6);
    }
}
