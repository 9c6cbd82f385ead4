//! SEC company directory: `company_tickers.json` → identity table.

use super::cleaner::{normalise_symbol, pad_cik};
use super::http_client::HttpClient;
use crate::config::ProviderConfig;
use crate::models::{CompanyIdentity, RawCompanyEntry};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use url::Url;

pub struct SecDirectory {
    client: HttpClient,
    url: Url,
    user_agent: String,
}

impl SecDirectory {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
            url: Url::parse(&config.sec_tickers_url)?,
            user_agent: config.sec_user_agent.clone(),
        })
    }

    /// Download the ticker file, save it verbatim to `json_path`, return the parsed identities.
    pub async fn refresh(&self, json_path: &Path) -> Result<Vec<CompanyIdentity>> {
        let body = self
            .client
            .get_text_as(&self.url, &self.user_agent)
            .await
            .with_context(|| format!("Failed to download {}", self.url))?;

        if let Some(parent) = json_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(json_path, &body)
            .with_context(|| format!("Failed to save {:?}", json_path))?;
        info!("Downloaded and saved {:?}", json_path);

        parse_company_tickers(&body)
    }
}

/// Parse `{"0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."}, ...}`.
/// Entries without a ticker are dropped.
pub fn parse_company_tickers(body: &str) -> Result<Vec<CompanyIdentity>> {
    let entries: BTreeMap<String, RawCompanyEntry> =
        serde_json::from_str(body).context("Malformed company tickers JSON")?;

    let mut keyed: Vec<(u64, RawCompanyEntry)> = entries
        .into_iter()
        .map(|(k, e)| (k.parse().unwrap_or(u64::MAX), e))
        .collect();
    keyed.sort_by_key(|(k, _)| *k);

    Ok(keyed
        .into_iter()
        .filter_map(|(_, e)| {
            let ticker = normalise_symbol(e.ticker.as_deref()?);
            if ticker.is_empty() {
                return None;
            }
            Some(CompanyIdentity {
                cik: e.cik_str.as_ref().and_then(pad_cik).unwrap_or_default(),
                ticker,
                name: e.title.unwrap_or_default(),
            })
        })
        .collect())
}

/// Write the identity table as `sec_company_list.csv` (CIK, Ticker, Name).
pub fn save_company_list(path: &Path, companies: &[CompanyIdentity]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = csv::Writer::from_path(path).with_context(|| format!("create {:?}", path))?;
    for c in companies {
        w.serialize(c)?;
    }
    w.flush()?;
    info!("Saved {} tickers from SEC to {:?}", companies.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_company_tickers() {
        let body = r#"{
            "1": {"cik_str": 789019, "ticker": "MSFT", "title": "MICROSOFT CORP"},
            "0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."},
            "2": {"cik_str": 1, "ticker": null, "title": "Nameless"}
        }"#;
        let companies = parse_company_tickers(body).unwrap();
        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].ticker, "AAPL");
        assert_eq!(companies[0].cik, "0000320193");
        assert_eq!(companies[1].name, "MICROSOFT CORP");
    }

    #[test]
    fn test_save_company_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sec_company_list.csv");
        let companies = parse_company_tickers(
            r#"{"0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."}}"#,
        )
        .unwrap();
        save_company_list(&path, &companies).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "CIK,Ticker,Name\n0000320193,AAPL,Apple Inc.\n");
    }
}
