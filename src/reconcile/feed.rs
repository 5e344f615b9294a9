//! External price feed
//!
//! Provides ticker snapshots from an exchange REST endpoint (MEXC futures by default).
//!
//! ## API Reference
//!
//! Endpoint: https://contract.mexc.com/api/v1/contract/ticker
//! Returns: `{"success": true, "code": 0, "data": [ticker, ...]}`
//!
//! The envelope is deserialized with serde. Providers disagree on ticker field names
//! and units, so each entry stays untyped JSON and is normalized here. Nothing past
//! this module sees provider field names.

use super::types::TickerSnapshot;
use crate::error::SyncError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// One entry of a feed response
#[derive(Debug, Clone, PartialEq)]
pub enum FeedTicker {
    Valid(TickerSnapshot),
    /// Entry that cannot be attributed to a symbol
    Malformed { reason: String },
}

/// Top-level shape of a feed response
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Tickers(Vec<Value>),
    Envelope(FeedEnvelope),
}

/// `{"success": true, "code": 0, "data": ...}`
#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    success: Option<Value>,
    code: Option<Value>,
    data: Option<Value>,
}

/// Source of ticker snapshots, called once per cycle
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Exchange label stored next to every ticker from this feed
    fn exchange(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<FeedTicker>, SyncError>;
}

/// Feed over HTTP GET
pub struct HttpPriceFeed {
    client: reqwest::Client,
    url: String,
    exchange: String,
    timeout: Duration,
}

impl HttpPriceFeed {
    pub fn new(
        url: impl Into<String>,
        exchange: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Unexpected(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            exchange: exchange.into(),
            timeout,
        })
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn fetch(&self) -> Result<Vec<FeedTicker>, SyncError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(SyncError::FeedStatus(response.status().as_u16()));
        }

        let body = response.text().await.map_err(|e| self.request_error(e))?;
        parse_feed_body(&body)
    }
}

impl HttpPriceFeed {
    fn request_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout {
                operation: "price feed request",
                after: self.timeout,
            }
        } else {
            SyncError::FeedUnavailable(err.to_string())
        }
    }
}

/// Parse a feed response body into per-ticker results
///
/// Accepts the `{"success", "data"}` envelope or a bare array. An envelope with
/// `success: false`, invalid JSON, or a missing array fail the whole payload;
/// individual bad entries only produce [`FeedTicker::Malformed`].
pub fn parse_feed_body(body: &str) -> Result<Vec<FeedTicker>, SyncError> {
    let parsed: FeedBody =
        serde_json::from_str(body).map_err(|e| SyncError::MalformedPayload(e.to_string()))?;

    let entries = match parsed {
        FeedBody::Tickers(entries) => entries,
        FeedBody::Envelope(envelope) => {
            if envelope.success.as_ref().and_then(Value::as_bool) == Some(false) {
                return Err(SyncError::MalformedPayload(format!(
                    "feed reported failure (code {})",
                    envelope.code.unwrap_or(Value::Null)
                )));
            }
            match envelope.data {
                Some(Value::Array(entries)) => entries,
                // Single-symbol endpoints return one object
                Some(Value::Object(single)) => vec![Value::Object(single)],
                _ => {
                    return Err(SyncError::MalformedPayload(
                        "response has no ticker array".to_string(),
                    ))
                }
            }
        }
    };

    Ok(entries.iter().map(parse_ticker).collect())
}

/// Normalize one ticker entry
pub fn parse_ticker(entry: &Value) -> FeedTicker {
    let Some(fields) = entry.as_object() else {
        return FeedTicker::Malformed {
            reason: format!("ticker is {} not an object", type_name(entry)),
        };
    };

    let symbol = fields
        .get("symbol")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if symbol.is_empty() {
        return FeedTicker::Malformed {
            reason: "ticker has no symbol".to_string(),
        };
    }

    // Fractional change (0.015) wins over an explicit percent when both exist
    let change_24h = match fields.get("riseFallRate") {
        Some(rate) => coerce_f64(rate) * 100.0,
        None => number(fields, &["priceChangePercent", "change"]),
    };

    FeedTicker::Valid(TickerSnapshot {
        symbol: symbol.to_string(),
        last_price: number(fields, &["lastPrice", "last"]),
        high_24h: number(fields, &["high24Price", "highPrice24", "high"]),
        low_24h: number(fields, &["lower24Price", "lowPrice24", "low"]),
        change_24h,
        volume_24h: number(fields, &["volume24", "volume"]),
    })
}

/// First present alias, coerced; 0 when none is present
fn number(fields: &Map<String, Value>, aliases: &[&str]) -> f64 {
    aliases
        .iter()
        .find_map(|key| fields.get(*key))
        .map(coerce_f64)
        .unwrap_or(0.0)
}

/// Numbers and numeric strings pass through, everything else is 0
fn coerce_f64(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
