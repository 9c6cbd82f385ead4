//! Yahoo Finance JSON response shapes and their conversion into rows.

use super::FetchError;
use super::cleaner::flatten_modules;
use crate::models::{MetricsRow, MinuteBar, QuoteRecord};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    description: String,
}

fn api_error(symbol: &str, err: Option<ApiError>, what: &str) -> FetchError {
    match err {
        Some(e) if e.code == "Not Found" => FetchError::NotFound(symbol.to_string()),
        Some(e) => FetchError::Decode(format!("{}: {}", e.code, e.description)),
        None => FetchError::Empty(format!("{} for {}", what, symbol)),
    }
}

// ── v7 quote ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    quote_response: QuoteResult,
}

#[derive(Debug, Deserialize)]
struct QuoteResult {
    #[serde(default)]
    result: Vec<QuoteData>,
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct QuoteData {
    symbol: String,
    quote_type: Option<String>,
    exchange: Option<String>,
    regular_market_price: Option<f64>,
    regular_market_previous_close: Option<f64>,
    regular_market_open: Option<f64>,
    regular_market_day_high: Option<f64>,
    regular_market_day_low: Option<f64>,
    regular_market_volume: Option<f64>,
    market_cap: Option<f64>,
    average_daily_volume10_day: Option<f64>,
    average_daily_volume3_month: Option<f64>,
    shares_outstanding: Option<f64>,
    fifty_two_week_high: Option<f64>,
    fifty_two_week_low: Option<f64>,
    fifty_two_week_change_percent: Option<f64>,
    fifty_day_average: Option<f64>,
    two_hundred_day_average: Option<f64>,
}

/// A quote with no last price is a failure.
pub fn parse_quote(
    symbol: &str,
    resp: QuoteResponse,
    now: DateTime<FixedOffset>,
) -> Result<QuoteRecord, FetchError> {
    let QuoteResult { result, error } = resp.quote_response;
    let q = result
        .into_iter()
        .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| api_error(symbol, error, "no quote"))?;

    let price = q
        .regular_market_price
        .ok_or_else(|| FetchError::Empty("No price data".to_string()))?;

    Ok(QuoteRecord {
        ticker: symbol.to_string(),
        price: Some(price),
        quote_type: q.quote_type,
        exchange: q.exchange,
        previous_close: q.regular_market_previous_close,
        open: q.regular_market_open,
        day_high: q.regular_market_day_high,
        day_low: q.regular_market_day_low,
        market_cap: q.market_cap,
        volume: q.regular_market_volume,
        avg_volume_10d: q.average_daily_volume10_day,
        avg_volume_3m: q.average_daily_volume3_month,
        shares: q.shares_outstanding,
        year_high: q.fifty_two_week_high,
        year_low: q.fifty_two_week_low,
        // provider reports percent; snapshots store the fraction
        year_change: q.fifty_two_week_change_percent.map(|p| p / 100.0),
        fifty_day_avg: q.fifty_day_average,
        two_hundred_day_avg: q.two_hundred_day_average,
        timestamp: Some(now),
    })
}

// ── v10 quoteSummary ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    quote_summary: SummaryResult,
}

#[derive(Debug, Deserialize)]
struct SummaryResult {
    result: Option<Vec<Map<String, Value>>>,
    error: Option<ApiError>,
}

pub fn parse_summary(
    symbol: &str,
    resp: SummaryResponse,
    now: DateTime<FixedOffset>,
) -> Result<MetricsRow, FetchError> {
    let SummaryResult { result, error } = resp.quote_summary;
    let modules = result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| api_error(symbol, error, "no summary"))?;

    let fields = flatten_modules(&modules);
    if fields.is_empty() {
        return Err(FetchError::Empty("Empty response (possible rate limit)".to_string()));
    }

    Ok(MetricsRow {
        ticker: symbol.to_string(),
        timestamp: Some(now),
        fields,
    })
}

/// The v7 quote object kept whole, for folding into an info row.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteFieldsResponse {
    quote_response: QuoteFieldsResult,
}

#[derive(Debug, Deserialize)]
struct QuoteFieldsResult {
    #[serde(default)]
    result: Vec<Map<String, Value>>,
    error: Option<ApiError>,
}

/// Add the quote's scalar fields (typeDisp, fullExchangeName, 50/200-day
/// changes, firstTradeDateMilliseconds, ...) to `row`. Keys the summary
/// modules already set are left alone. Returns how many fields were added.
pub fn merge_quote_fields(
    row: &mut MetricsRow,
    resp: QuoteFieldsResponse,
) -> Result<usize, FetchError> {
    let QuoteFieldsResult { result, error } = resp.quote_response;
    let quote = result
        .into_iter()
        .find(|q| {
            q.get("symbol")
                .and_then(Value::as_str)
                .is_some_and(|s| s.eq_ignore_ascii_case(&row.ticker))
        })
        .ok_or_else(|| api_error(&row.ticker, error, "no quote"))?;

    let mut added = 0;
    for (key, value) in quote {
        if row.fields.contains_key(&key) {
            continue;
        }
        if matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_)) {
            row.fields.insert(key, value);
            added += 1;
        }
    }
    Ok(added)
}

// ── v7 spark (multi-ticker) ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SparkResponse {
    spark: SparkResult,
}

#[derive(Debug, Deserialize)]
struct SparkResult {
    result: Option<Vec<SparkSymbol>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct SparkSymbol {
    symbol: String,
    #[serde(default)]
    response: Vec<ChartData>,
}

/// Last non-null close per returned symbol; symbols absent from the response are absent here.
pub fn parse_spark(resp: SparkResponse) -> Result<HashMap<String, Option<f64>>, FetchError> {
    let SparkResult { result, error } = resp.spark;
    let Some(result) = result else {
        return Err(api_error("batch", error, "no spark data"));
    };

    Ok(result
        .into_iter()
        .map(|s| {
            let last = s
                .response
                .first()
                .and_then(|d| d.indicators.quote.first())
                .and_then(|q| q.close.iter().rev().find_map(|c| *c));
            (s.symbol.to_uppercase(), last)
        })
        .collect())
}

// ── v8 chart ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
    #[serde(default)]
    events: Events,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChartMeta {
    gmtoffset: i32,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuoteSeries {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Events {
    dividends: BTreeMap<String, Dividend>,
    splits: BTreeMap<String, Split>,
}

#[derive(Debug, Deserialize)]
struct Dividend {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct Split {
    numerator: f64,
    denominator: f64,
    date: i64,
}

pub fn parse_chart(symbol: &str, resp: ChartResponse) -> Result<Vec<MinuteBar>, FetchError> {
    let ChartResult { result, error } = resp.chart;
    let data = result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| api_error(symbol, error, "no chart"))?;

    let offset = FixedOffset::east_opt(data.meta.gmtoffset)
        .ok_or_else(|| FetchError::Decode(format!("bad gmtoffset {}", data.meta.gmtoffset)))?;
    let quote = data.indicators.quote.into_iter().next().unwrap_or_default();

    let dividends: HashMap<i64, f64> = data
        .events
        .dividends
        .values()
        .map(|d| (d.date, d.amount))
        .collect();
    let splits: HashMap<i64, f64> = data
        .events
        .splits
        .values()
        .filter(|s| s.denominator != 0.0)
        .map(|s| (s.date, s.numerator / s.denominator))
        .collect();

    let at = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();

    let mut bars = Vec::with_capacity(data.timestamp.len());
    for (i, &ts) in data.timestamp.iter().enumerate() {
        let (open, high, low, close) = (
            at(&quote.open, i),
            at(&quote.high, i),
            at(&quote.low, i),
            at(&quote.close, i),
        );
        // Skip minutes with no trade at all
        if open.is_none() && high.is_none() && low.is_none() && close.is_none() {
            continue;
        }
        bars.push(MinuteBar {
            date: DateTime::from_timestamp(ts, 0).map(|d| d.with_timezone(&offset)),
            volume: at(&quote.volume, i),
            open,
            high,
            low,
            close,
            dividends: dividends.get(&ts).copied().unwrap_or(0.0),
            stock_splits: splits.get(&ts).copied().unwrap_or(0.0),
        });
    }

    if bars.is_empty() {
        return Err(FetchError::Empty(format!("no bars for {}", symbol)));
    }
    Ok(bars)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_ts;

    fn now() -> DateTime<FixedOffset> {
        parse_ts("2024-06-03 10:15:00").unwrap()
    }

    #[test]
    fn test_parse_quote() {
        let resp: QuoteResponse = serde_json::from_str(
            r#"{"quoteResponse":{"result":[{
                "symbol":"AAPL","quoteType":"EQUITY","exchange":"NMS",
                "regularMarketPrice":190.1,"regularMarketPreviousClose":188.0,
                "regularMarketOpen":189.0,"regularMarketDayHigh":191.0,"regularMarketDayLow":187.5,
                "regularMarketVolume":51000000,"marketCap":2.9e12,
                "averageDailyVolume10Day":55000000,"averageDailyVolume3Month":60000000,
                "sharesOutstanding":15300000000,"fiftyTwoWeekHigh":199.6,"fiftyTwoWeekLow":164.1,
                "fiftyTwoWeekChangePercent":12.5,"fiftyDayAverage":180.2,"twoHundredDayAverage":182.3
            }],"error":null}}"#,
        )
        .unwrap();

        let q = parse_quote("AAPL", resp, now()).unwrap();
        assert_eq!(q.price, Some(190.1));
        assert_eq!(q.quote_type.as_deref(), Some("EQUITY"));
        assert_eq!(q.exchange.as_deref(), Some("NMS"));
        assert_eq!(q.volume, Some(51_000_000.0));
        assert_eq!(q.year_change, Some(0.125));
        assert_eq!(q.timestamp, Some(now()));
    }

    #[test]
    fn test_parse_quote_missing_price_is_error() {
        let resp: QuoteResponse = serde_json::from_str(
            r#"{"quoteResponse":{"result":[{"symbol":"ZZZ"}],"error":null}}"#,
        )
        .unwrap();
        assert!(matches!(parse_quote("ZZZ", resp, now()), Err(FetchError::Empty(_))));

        let resp: QuoteResponse =
            serde_json::from_str(r#"{"quoteResponse":{"result":[],"error":null}}"#).unwrap();
        assert!(matches!(parse_quote("ZZZ", resp, now()), Err(FetchError::Empty(_))));
    }

    #[test]
    fn test_parse_summary_not_found() {
        let resp: SummaryResponse = serde_json::from_str(
            r#"{"quoteSummary":{"result":null,"error":{"code":"Not Found","description":"Quote not found for symbol: ZZZ"}}}"#,
        )
        .unwrap();
        assert!(matches!(parse_summary("ZZZ", resp, now()), Err(FetchError::NotFound(_))));
    }

    #[test]
    fn test_parse_summary_flattens() {
        let resp: SummaryResponse = serde_json::from_str(
            r#"{"quoteSummary":{"result":[{
                "assetProfile":{"industry":"Semiconductors","sector":"Technology"},
                "financialData":{"totalRevenue":{"raw":6.1e10,"fmt":"61B"},"ebitda":{"raw":3.4e10}}
            }],"error":null}}"#,
        )
        .unwrap();
        let row = parse_summary("NVDA", resp, now()).unwrap();
        assert_eq!(row.number("totalRevenue"), Some(6.1e10));
        assert_eq!(row.fields["industry"], Value::from("Semiconductors"));
    }

    #[test]
    fn test_quote_fields_complete_index_profile() {
        let summary: SummaryResponse = serde_json::from_str(
            r#"{"quoteSummary":{"result":[{
                "price":{"regularMarketPrice":{"raw":5300.5,"fmt":"5,300.50"},"exchangeName":"SNP"},
                "quoteType":{"quoteType":"INDEX","shortName":"S&P 500"},
                "summaryDetail":{"fiftyDayAverage":{"raw":5200.1}}
            }],"error":null}}"#,
        )
        .unwrap();
        let quote: QuoteFieldsResponse = serde_json::from_str(
            r#"{"quoteResponse":{"result":[{
                "symbol":"^GSPC","typeDisp":"Index","fullExchangeName":"SNP",
                "exchangeName":"ignored","fiftyDayAverage":1.0,
                "fiftyDayAverageChange":100.4,"fiftyDayAverageChangePercent":0.0193,
                "twoHundredDayAverageChange":450.2,"twoHundredDayAverageChangePercent":0.092,
                "firstTradeDateMilliseconds":-1325583000000,
                "corporateActions":[]
            }],"error":null}}"#,
        )
        .unwrap();

        let mut row = parse_summary("^GSPC", summary, now()).unwrap();
        let added = merge_quote_fields(&mut row, quote).unwrap();
        assert_eq!(added, 8);
        // summary values win over the quote's
        assert_eq!(row.fields["exchangeName"], Value::from("SNP"));
        assert_eq!(row.number("fiftyDayAverage"), Some(5200.1));
        assert!(!row.fields.contains_key("corporateActions"));

        row.fields.insert("IndexName".into(), Value::from("S&P 500"));
        let cfg = crate::config::AppConfig::default();
        let table = crate::analytics::metrics_table(&[row], &cfg.metrics.columns, &cfg.metrics.rename);
        assert_eq!(
            table.columns,
            vec![
                "Ticker", "Name", "Type", "Exchange", "50d Chg", "50d % Chg", "200d Chg",
                "200d % Chg", "First Trade", "Timestamp",
            ]
        );
    }

    #[test]
    fn test_merge_quote_fields_missing_symbol() {
        let quote: QuoteFieldsResponse =
            serde_json::from_str(r#"{"quoteResponse":{"result":[],"error":null}}"#).unwrap();
        let mut row = MetricsRow {
            ticker: "ZZZ".into(),
            ..Default::default()
        };
        assert!(matches!(merge_quote_fields(&mut row, quote), Err(FetchError::Empty(_))));
        assert!(row.fields.is_empty());
    }

    #[test]
    fn test_parse_spark_last_non_null() {
        let resp: SparkResponse = serde_json::from_str(
            r#"{"spark":{"result":[
                {"symbol":"AAPL","response":[{"meta":{"gmtoffset":-14400},"timestamp":[1,2,3],
                  "indicators":{"quote":[{"close":[190.0,191.5,null]}]}}]},
                {"symbol":"MSFT","response":[{"meta":{},"timestamp":[],
                  "indicators":{"quote":[{"close":[]}]}}]}
            ],"error":null}}"#,
        )
        .unwrap();
        let closes = parse_spark(resp).unwrap();
        assert_eq!(closes["AAPL"], Some(191.5));
        assert_eq!(closes["MSFT"], None);
        assert!(!closes.contains_key("IBM"));
    }

    #[test]
    fn test_parse_chart_minutes() {
        let resp: ChartResponse = serde_json::from_str(
            r#"{"chart":{"result":[{
                "meta":{"gmtoffset":-14400},
                "timestamp":[1717421400,1717421460,1717421520],
                "indicators":{"quote":[{
                    "open":[10.0,null,10.2],"high":[10.1,null,10.3],
                    "low":[9.9,null,10.1],"close":[10.05,null,10.25],
                    "volume":[1000,null,1500]}]},
                "events":{"dividends":{"1717421520":{"amount":0.24,"date":1717421520}}}
            }],"error":null}}"#,
        )
        .unwrap();
        let bars = parse_chart("AAPL", resp).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].dividends, 0.24);
        assert_eq!(bars[0].stock_splits, 0.0);
        let d = bars[0].date.unwrap();
        assert_eq!(d.offset().local_minus_utc(), -14400);
        assert_eq!(d.format("%H:%M").to_string(), "09:30");
    }
}
