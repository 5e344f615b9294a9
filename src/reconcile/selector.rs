//! Reconciliation Selector
//!
//! Chooses which local signals go to the coordinator this cycle: fresh, in an
//! allowed lifecycle status, best score first, at most `limit` of them.

use super::types::{NumericField, SignalRecord};
use crate::clock::cutoff;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::time::Duration;

/// Filter applied to `trading_signals`
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub max_age: Duration,
    pub limit: usize,
    pub statuses: Vec<String>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            limit: 20,
            statuses: vec!["PENDING".to_string(), "VALIDATED".to_string()],
        }
    }
}

/// Signals eligible for propagation, ordered by score descending
///
/// Pure read. Nothing qualifying yields an empty batch. A signal created exactly
/// `max_age` ago is already too old. Rows with a non-numeric score rank below every
/// numeric one, so they only fill slots no valid signal wants.
pub fn select_signals(
    conn: &Connection,
    policy: &SelectionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<SignalRecord>, SyncError> {
    if policy.statuses.is_empty() || policy.limit == 0 {
        return Ok(Vec::new());
    }

    let placeholders = (0..policy.statuses.len())
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        r#"
        SELECT id, symbol, direction, score, entry_price, tp1, tp2, tp3, sl,
               ai_consensus, consensus_level, status, created_at
        FROM trading_signals
        WHERE created_at > ?1
          AND status IN ({})
        ORDER BY typeof(score) IN ('integer', 'real') DESC,
                 score DESC, created_at DESC, id ASC
        LIMIT ?2
        "#,
        placeholders
    );

    let mut bindings: Vec<Value> = Vec::with_capacity(policy.statuses.len() + 2);
    bindings.push(Value::Text(cutoff(now, policy.max_age)));
    bindings.push(Value::Integer(i64::try_from(policy.limit).unwrap_or(i64::MAX)));
    bindings.extend(policy.statuses.iter().cloned().map(Value::Text));

    let mut stmt = conn.prepare(&sql)?;
    let signals = stmt
        .query_map(params_from_iter(bindings), signal_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(signals)
}

/// Best `n` currently eligible signals, for the end-of-cycle summary
pub fn top_signals(
    conn: &Connection,
    policy: &SelectionPolicy,
    n: usize,
    now: DateTime<Utc>,
) -> Result<Vec<SignalRecord>, SyncError> {
    let narrowed = SelectionPolicy {
        limit: n.min(policy.limit),
        ..policy.clone()
    };
    select_signals(conn, &narrowed, now)
}

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<SignalRecord> {
    Ok(SignalRecord {
        id: row.get(0)?,
        symbol: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        direction: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        score: NumericField::from_sql(row.get_ref(3)?),
        entry_price: NumericField::from_sql(row.get_ref(4)?),
        tp1: NumericField::from_sql(row.get_ref(5)?),
        tp2: NumericField::from_sql(row.get_ref(6)?),
        tp3: NumericField::from_sql(row.get_ref(7)?),
        sl: NumericField::from_sql(row.get_ref(8)?),
        ai_consensus: row.get(9)?,
        consensus_level: row.get(10)?,
        status: row.get(11)?,
        created_at: row.get(12)?,
    })
}
