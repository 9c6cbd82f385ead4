use super::FetchError;
use crate::config::ProviderConfig;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

pub struct HttpClient {
    inner: reqwest::Client,
    config: ProviderConfig,
}

impl HttpClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Crumb handshake relies on session cookies
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    /// GET a URL as text after the polite delay. Non-2xx statuses become typed errors.
    pub async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
        self.send(url, None).await
    }

    /// Same as [`get_text`](Self::get_text) with an explicit User-Agent.
    pub async fn get_text_as(&self, url: &Url, user_agent: &str) -> Result<String, FetchError> {
        self.send(url, Some(user_agent)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, FetchError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Fire a request only for the cookies it sets; the status is irrelevant.
    pub async fn touch(&self, url: &Url) {
        debug!("GET {} (cookie)", url);
        if let Err(e) = self.inner.get(url.clone()).send().await {
            warn!("Cookie request to {} failed: {}", url, e);
        }
    }

    async fn send(&self, url: &Url, user_agent: Option<&str>) -> Result<String, FetchError> {
        self.polite_delay().await;
        debug!("GET {}", url);

        let mut req = self.inner.get(url.clone());
        if let Some(ua) = user_agent {
            req = req.header(reqwest::header::USER_AGENT, ua);
        }

        let resp = req.send().await?;
        let status = resp.status();

        match status {
            s if s.is_success() => Ok(resp.text().await?),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                warn!("Rate limited ({}) on {}", status, url);
                Err(FetchError::RateLimited(status.as_u16()))
            }
            StatusCode::UNAUTHORIZED => Err(FetchError::Unauthorized),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(url.path().to_string())),
            _ => Err(FetchError::Http(status.as_u16())),
        }
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let jitter = (rand::random::<f64>() * self.config.jitter_ms as f64) as u64;
        let total = Duration::from_millis(self.config.request_delay_ms + jitter);
        if !total.is_zero() {
            sleep(total).await;
        }
    }
}
