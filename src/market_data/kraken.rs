// =============================================================================
// Kraken Public REST Client — OHLC and Ticker reads
// =============================================================================
//
// Only the public (unsigned) endpoints are used; the arena never places real
// orders. Kraken returns numeric fields as JSON strings inside positional
// arrays, so parsing goes through small index helpers. A non-empty `error`
// array in the response body fails the whole call.
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::market_data::{Candle, Ticker};

/// Upstream market data source for one pair universe.
///
/// The arena core only ever reads candles and tickers; a failing call fails
/// the whole snapshot refresh (the cache keeps its previous value).
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Ordered candle series for `pair` at `interval_minutes`
    /// (one of 5, 15, 60, 240, 1440).
    async fn fetch_candles(&self, pair: &str, interval_minutes: u32) -> Result<Vec<Candle>>;

    /// Current ticker for `pair`.
    async fn fetch_ticker(&self, pair: &str) -> Result<Ticker>;
}

/// Kraken public REST API client.
#[derive(Clone)]
pub struct KrakenClient {
    base_url: String,
    client: reqwest::Client,
}

impl KrakenClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: "https://api.kraken.com".to_string(),
            client,
        }
    }

    /// Client against a non-default base URL (test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut c = Self::new();
        c.base_url = base_url.into();
        c
    }

    /// "XRP/EUR" -> "XRPEUR" (Kraken accepts the unslashed form).
    fn api_pair(pair: &str) -> String {
        pair.replace('/', "")
    }

    /// GET a public endpoint and return the `result` object after checking
    /// the Kraken `error` array.
    async fn get_result(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            bail!("Kraken {path} returned {status}: {body}");
        }

        if let Some(errors) = body.get("error").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                bail!("Kraken {path} error: {errors:?}");
            }
        }

        body.get("result")
            .cloned()
            .with_context(|| format!("{path} response missing 'result'"))
    }
}

impl Default for KrakenClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketSource for KrakenClient {
    #[instrument(skip(self), name = "kraken::fetch_candles")]
    async fn fetch_candles(&self, pair: &str, interval_minutes: u32) -> Result<Vec<Candle>> {
        let result = self
            .get_result(
                "/0/public/OHLC",
                &[
                    ("pair", Self::api_pair(pair)),
                    ("interval", interval_minutes.to_string()),
                ],
            )
            .await?;

        // The result object keys the series by Kraken's internal pair name
        // (e.g. "XXRPZEUR") next to a "last" cursor; take the array value.
        let series = result
            .as_object()
            .and_then(|obj| {
                obj.iter()
                    .find(|(k, v)| *k != "last" && v.is_array())
                    .map(|(_, v)| v)
            })
            .context("OHLC response contained no candle series")?;

        let rows = series.as_array().context("candle series is not an array")?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(parse_candle(row)?);
        }

        debug!(pair, interval_minutes, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "kraken::fetch_ticker")]
    async fn fetch_ticker(&self, pair: &str) -> Result<Ticker> {
        let result = self
            .get_result("/0/public/Ticker", &[("pair", Self::api_pair(pair))])
            .await?;

        let entry = result
            .as_object()
            .and_then(|obj| obj.values().next())
            .context("ticker response contained no pair entry")?;

        let ticker = parse_ticker(entry)?;
        debug!(pair, last = ticker.last, "ticker fetched");
        Ok(ticker)
    }
}

// =============================================================================
// Parse helpers
// =============================================================================

/// Kraken encodes numbers as strings; accept either representation.
fn num_at(value: &Value, idx: usize) -> Result<f64> {
    let v = value
        .get(idx)
        .with_context(|| format!("missing field at index {idx}"))?;
    match v {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("non-numeric string at index {idx}: {s:?}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("non-f64 number at index {idx}")),
        other => bail!("unexpected value at index {idx}: {other}"),
    }
}

/// `[time, open, high, low, close, vwap, volume, count]`
fn parse_candle(row: &Value) -> Result<Candle> {
    Ok(Candle {
        time_sec: row
            .get(0)
            .and_then(|v| v.as_i64())
            .context("candle missing timestamp")?,
        open: num_at(row, 1)?,
        high: num_at(row, 2)?,
        low: num_at(row, 3)?,
        close: num_at(row, 4)?,
        vwap: num_at(row, 5)?,
        volume: num_at(row, 6)?,
        count: row.get(7).and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

/// Ticker entry: a/b/c are [price, ...] arrays, h/l/v are [today, last24h],
/// o is the 24-hour open.
fn parse_ticker(entry: &Value) -> Result<Ticker> {
    let first = |key: &str| -> Result<f64> {
        let arr = entry
            .get(key)
            .with_context(|| format!("ticker missing '{key}'"))?;
        num_at(arr, 0)
    };
    let second = |key: &str| -> Result<f64> {
        let arr = entry
            .get(key)
            .with_context(|| format!("ticker missing '{key}'"))?;
        num_at(arr, 1)
    };

    let open_24h = match entry.get("o") {
        Some(Value::Array(_)) => second("o")?,
        Some(Value::String(s)) => s.parse().context("non-numeric ticker open")?,
        Some(Value::Number(n)) => n.as_f64().context("non-f64 ticker open")?,
        _ => bail!("ticker missing 'o'"),
    };

    Ok(Ticker {
        bid: first("b")?,
        ask: first("a")?,
        last: first("c")?,
        open_24h,
        high_24h: second("h")?,
        low_24h: second("l")?,
        volume_24h: second("v")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
