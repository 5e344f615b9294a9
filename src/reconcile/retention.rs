//! Retention Sweeper
//!
//! Price history and the local audit mirror are disposable telemetry. Rows past
//! their horizon are deleted outright.

use crate::clock::cutoff;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub price_history: Duration,
    pub sync_log: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            price_history: Duration::from_secs(24 * 3600),
            sync_log: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub price_history_deleted: usize,
    pub sync_log_deleted: usize,
}

/// Delete rows strictly older than each horizon
pub fn sweep(
    conn: &mut Connection,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport, SyncError> {
    let tx = conn.transaction()?;
    let price_history_deleted = tx.execute(
        "DELETE FROM price_history WHERE observed_at < ?1",
        [cutoff(now, policy.price_history)],
    )?;
    let sync_log_deleted = tx.execute(
        "DELETE FROM sync_log WHERE timestamp < ?1",
        [cutoff(now, policy.sync_log)],
    )?;
    tx.commit()?;

    let report = SweepReport {
        price_history_deleted,
        sync_log_deleted,
    };
    if report != SweepReport::default() {
        log::info!(
            "🧹 Swept {} price rows, {} sync log rows",
            report.price_history_deleted,
            report.sync_log_deleted
        );
    }
    Ok(report)
}
