//! Core records moved through the reconciliation cycle
//!
//! Table mapping:
//! - `tickers_cache` / `price_history` → [`TickerRecord`]
//! - `trading_signals` → [`SignalRecord`] (read-only)
//! - coordinator `signal_cache` → [`SignalCacheEntry`]
//! - `sync_log` (both sides) → [`SyncAuditRecord`]
//! - `bot_status` → [`LivenessRecord`]

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;

/// Action label written into every audit row produced by a signal push
pub const SIGNAL_SYNC_ACTION: &str = "SIGNAL_SYNC";

/// One ticker as it came off the feed, already normalized
#[derive(Debug, Clone, PartialEq)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    /// Percent, never a fraction
    pub change_24h: f64,
    pub volume_24h: f64,
}

/// Stored ticker row
#[derive(Debug, Clone, PartialEq)]
pub struct TickerRecord {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub change_24h: f64,
    pub volume_24h: f64,
    pub observed_at: String,
    pub source_node: Option<String>,
}

/// A numeric column read without trusting its storage class
///
/// SQLite lets any column hold text. A malformed value is carried to the push
/// boundary where only the affected record is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericField {
    Number(f64),
    Null,
    Malformed(String),
}

impl NumericField {
    pub fn from_sql(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => NumericField::Null,
            ValueRef::Integer(i) => NumericField::Number(i as f64),
            ValueRef::Real(f) => NumericField::Number(f),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                match text.trim().parse::<f64>() {
                    Ok(v) if v.is_finite() => NumericField::Number(v),
                    _ => NumericField::Malformed(text.into_owned()),
                }
            }
            ValueRef::Blob(bytes) => NumericField::Malformed(format!("<blob {} bytes>", bytes.len())),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NumericField::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Required numeric value, or the reason it is unusable
    pub fn required(&self, column: &str) -> Result<f64, String> {
        match self {
            NumericField::Number(v) => Ok(*v),
            NumericField::Null => Err(format!("{} is NULL", column)),
            NumericField::Malformed(raw) => Err(format!("{} is not numeric ({:?})", column, raw)),
        }
    }

    /// Optional numeric value; NULL is fine, garbage is not
    pub fn optional(&self, column: &str) -> Result<Option<f64>, String> {
        match self {
            NumericField::Number(v) => Ok(Some(*v)),
            NumericField::Null => Ok(None),
            NumericField::Malformed(raw) => Err(format!("{} is not numeric ({:?})", column, raw)),
        }
    }
}

/// Row of `trading_signals`, produced by the signal generator
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    pub id: i64,
    pub symbol: String,
    pub direction: String,
    pub score: NumericField,
    pub entry_price: NumericField,
    pub tp1: NumericField,
    pub tp2: NumericField,
    pub tp3: NumericField,
    pub sl: NumericField,
    pub ai_consensus: Option<String>,
    pub consensus_level: Option<String>,
    pub status: String,
    pub created_at: String,
}

/// Row of the coordinator's `signal_cache`
#[derive(Debug, Clone, PartialEq)]
pub struct SignalCacheEntry {
    pub symbol: String,
    pub score: f64,
    pub direction: String,
    pub sl: Option<f64>,
    pub confidence: f64,
    pub computed_at: String,
    pub sources: Vec<String>,
}

impl SignalCacheEntry {
    /// Coerce a local signal into the coordinator's shape
    ///
    /// Score doubles as confidence. Fails with a data-shape error when the score
    /// or stop loss is unusable, or symbol/direction are blank.
    pub fn from_signal(signal: &SignalRecord, node_id: &str) -> Result<Self, SyncError> {
        let key = if signal.symbol.trim().is_empty() {
            format!("signal #{}", signal.id)
        } else {
            signal.symbol.clone()
        };

        if signal.symbol.trim().is_empty() {
            return Err(SyncError::malformed(key, "symbol is empty"));
        }
        if signal.direction.trim().is_empty() {
            return Err(SyncError::malformed(key, "direction is empty"));
        }

        let score = signal
            .score
            .required("score")
            .map_err(|reason| SyncError::malformed(&key, reason))?;
        let sl = signal
            .sl
            .optional("sl")
            .map_err(|reason| SyncError::malformed(&key, reason))?;

        Ok(Self {
            symbol: signal.symbol.clone(),
            score,
            direction: signal.direction.clone(),
            sl,
            confidence: score,
            computed_at: signal.created_at.clone(),
            sources: vec![node_id.to_string()],
        })
    }
}

/// Row of `sync_log`
#[derive(Debug, Clone, PartialEq)]
pub struct SyncAuditRecord {
    pub machine_ip: String,
    pub action: String,
    pub records_synced: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    Up,
    Down,
    Online,
    Offline,
}

impl LivenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessStatus::Up => "UP",
            LivenessStatus::Down => "DOWN",
            LivenessStatus::Online => "ONLINE",
            LivenessStatus::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UP" => Some(LivenessStatus::Up),
            "DOWN" => Some(LivenessStatus::Down),
            "ONLINE" => Some(LivenessStatus::Online),
            "OFFLINE" => Some(LivenessStatus::Offline),
            _ => None,
        }
    }
}

/// Row of `bot_status`
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessRecord {
    pub bot_name: String,
    pub status: LivenessStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(symbol: &str, score: NumericField, sl: NumericField) -> SignalRecord {
        SignalRecord {
            id: 7,
            symbol: symbol.to_string(),
            direction: "LONG".to_string(),
            score,
            entry_price: NumericField::Number(100.0),
            tp1: NumericField::Null,
            tp2: NumericField::Null,
            tp3: NumericField::Null,
            sl,
            ai_consensus: None,
            consensus_level: None,
            status: "PENDING".to_string(),
            created_at: "2026-03-01 11:30:00".to_string(),
        }
    }

    #[test]
    fn test_numeric_field_from_sql() {
        assert_eq!(NumericField::from_sql(ValueRef::Integer(3)), NumericField::Number(3.0));
        assert_eq!(NumericField::from_sql(ValueRef::Real(2.5)), NumericField::Number(2.5));
        assert_eq!(NumericField::from_sql(ValueRef::Text(b" 4.25 ")), NumericField::Number(4.25));
        assert_eq!(NumericField::from_sql(ValueRef::Null), NumericField::Null);
        assert_eq!(
            NumericField::from_sql(ValueRef::Text(b"strong")),
            NumericField::Malformed("strong".to_string())
        );
        assert!(matches!(
            NumericField::from_sql(ValueRef::Text(b"NaN")),
            NumericField::Malformed(_)
        ));
    }

    #[test]
    fn test_cache_entry_from_signal() {
        let entry = SignalCacheEntry::from_signal(
            &signal("BTC_USDT", NumericField::Number(87.5), NumericField::Null),
            "192.168.1.113",
        )
        .unwrap();

        assert_eq!(entry.symbol, "BTC_USDT");
        assert_eq!(entry.score, 87.5);
        assert_eq!(entry.confidence, 87.5);
        assert_eq!(entry.sl, None);
        assert_eq!(entry.computed_at, "2026-03-01 11:30:00");
        assert_eq!(entry.sources, vec!["192.168.1.113"]);
    }

    #[test]
    fn test_cache_entry_rejects_bad_fields() {
        let bad_score = SignalCacheEntry::from_signal(
            &signal("ETH_USDT", NumericField::Malformed("high".into()), NumericField::Null),
            "n1",
        );
        assert!(matches!(
            bad_score,
            Err(SyncError::MalformedRecord { ref key, .. }) if key == "ETH_USDT"
        ));

        let bad_sl = SignalCacheEntry::from_signal(
            &signal("ETH_USDT", NumericField::Number(50.0), NumericField::Malformed("-".into())),
            "n1",
        );
        assert!(bad_sl.is_err());

        let no_symbol = SignalCacheEntry::from_signal(
            &signal(" ", NumericField::Number(50.0), NumericField::Null),
            "n1",
        );
        assert!(matches!(
            no_symbol,
            Err(SyncError::MalformedRecord { ref key, .. }) if key == "signal #7"
        ));
    }
}
