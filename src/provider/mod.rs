pub mod cleaner;
pub mod http_client;
pub mod parsers;
pub mod sec;

use crate::config::ProviderConfig;
use crate::models::{MetricsRow, MinuteBar, QuoteRecord};
use crate::utils::now_eastern;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use self::http_client::HttpClient;
use self::parsers::{
    ChartResponse, QuoteFieldsResponse, QuoteResponse, SparkResponse, SummaryResponse,
    merge_quote_fields, parse_chart, parse_quote, parse_spark, parse_summary,
};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited (HTTP {0})")]
    RateLimited(u16),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Empty(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("HTTP error {0}")]
    Http(u16),
    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("batch fetch failed: {0}")]
    Batch(String),
}

impl FetchError {
    /// Unknown symbols will not appear on a second try.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::NotFound(_))
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable data source abstraction.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Lightweight quote: price, volume, ranges, averages.
    async fn fast_quote(&self, ticker: &str) -> Result<QuoteRecord, FetchError>;

    /// Full fundamentals payload, flattened to scalars.
    async fn info(&self, ticker: &str) -> Result<MetricsRow, FetchError>;

    /// Last 1-minute close of the current session for a batch of tickers.
    async fn last_closes(&self, tickers: &[String])
        -> Result<HashMap<String, Option<f64>>, FetchError>;

    async fn intraday_history(
        &self,
        ticker: &str,
        range: &str,
        interval: &str,
    ) -> Result<Vec<MinuteBar>, FetchError>;
}

// ── Yahoo Finance ─────────────────────────────────────────────────────────────

const SUMMARY_MODULES: &str =
    "assetProfile,summaryDetail,defaultKeyStatistics,financialData,price,quoteType";

pub struct YahooSource {
    client: HttpClient,
    base_url: Url,
    cookie_url: Url,
    crumb: Mutex<Option<String>>,
}

impl YahooSource {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
            base_url: Url::parse(&config.quote_base_url)?,
            cookie_url: Url::parse(&config.cookie_url)?,
            crumb: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| FetchError::Decode(format!("bad endpoint {}: {}", path, e)))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    /// Session crumb, fetched once and shared by all workers.
    async fn crumb(&self) -> Result<String, FetchError> {
        let mut guard = self.crumb.lock().await;
        if let Some(c) = guard.as_ref() {
            return Ok(c.clone());
        }

        self.client.touch(&self.cookie_url).await;
        let url = self.endpoint("/v1/test/getcrumb", &[])?;
        let crumb = self.client.get_text(&url).await?.trim().to_string();
        if crumb.is_empty() || crumb.contains('<') {
            return Err(FetchError::Empty("no crumb issued".to_string()));
        }

        info!("Obtained provider session crumb");
        *guard = Some(crumb.clone());
        Ok(crumb)
    }

    /// GET a crumb-authenticated endpoint; a rejected crumb is refreshed once.
    async fn get_authed<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, FetchError>
    where
        T: serde::de::DeserializeOwned,
    {
        for refreshed in [false, true] {
            let crumb = self.crumb().await?;
            let mut params = query.to_vec();
            params.push(("crumb", crumb.as_str()));
            let url = self.endpoint(path, &params)?;

            match self.client.get_json(&url).await {
                Err(FetchError::Unauthorized) if !refreshed => {
                    warn!("Crumb rejected, refreshing session");
                    *self.crumb.lock().await = None;
                }
                other => return other,
            }
        }
        Err(FetchError::Unauthorized)
    }
}

#[async_trait]
impl MarketDataSource for YahooSource {
    async fn fast_quote(&self, ticker: &str) -> Result<QuoteRecord, FetchError> {
        let resp: QuoteResponse = self
            .get_authed("/v7/finance/quote", &[("symbols", ticker)])
            .await?;
        parse_quote(ticker, resp, now_eastern())
    }

    async fn info(&self, ticker: &str) -> Result<MetricsRow, FetchError> {
        let path = format!("/v10/finance/quoteSummary/{}", ticker);
        let resp: SummaryResponse = self
            .get_authed(&path, &[("modules", SUMMARY_MODULES), ("formatted", "false")])
            .await?;
        let mut row = parse_summary(ticker, resp, now_eastern())?;

        // quote-level fields (typeDisp, fullExchangeName, ...) live only in v7 quote
        let quote: Result<QuoteFieldsResponse, FetchError> = self
            .get_authed("/v7/finance/quote", &[("symbols", ticker)])
            .await;
        match quote.and_then(|q| merge_quote_fields(&mut row, q)) {
            Ok(added) => debug!("{}: {} quote fields added", ticker, added),
            Err(e) => warn!("{}: quote fields unavailable: {}", ticker, e),
        }

        debug!("{}: {} info fields", ticker, row.fields.len());
        Ok(row)
    }

    async fn last_closes(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, Option<f64>>, FetchError> {
        let symbols = tickers.join(",");
        let url = self.endpoint(
            "/v7/finance/spark",
            &[("symbols", symbols.as_str()), ("range", "1d"), ("interval", "1m")],
        )?;
        let resp: SparkResponse = self.client.get_json(&url).await?;
        parse_spark(resp)
    }

    async fn intraday_history(
        &self,
        ticker: &str,
        range: &str,
        interval: &str,
    ) -> Result<Vec<MinuteBar>, FetchError> {
        let path = format!("/v8/finance/chart/{}", ticker);
        let url = self.endpoint(
            &path,
            &[("range", range), ("interval", interval), ("events", "div,splits")],
        )?;
        let resp: ChartResponse = self.client.get_json(&url).await?;
        parse_chart(ticker, resp)
    }
}
