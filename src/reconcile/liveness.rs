//! Liveness Reporter
//!
//! Keeps this node's rows in `bot_status` and `lm_machines` current. Only the local
//! store is touched, so a heartbeat lands even while the coordinator is down.

use super::types::{LivenessRecord, LivenessStatus};
use crate::clock::{parse_sql_timestamp, sql_timestamp};
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

/// Rows owned by this node
#[derive(Debug, Clone)]
pub struct LivenessIdentity {
    pub bot_name: String,
    pub node_id: String,
}

/// Mark the node up and add one cycle interval to its uptime
///
/// Missing rows are created so a freshly provisioned node reports on its first cycle.
pub fn heartbeat(
    conn: &mut Connection,
    identity: &LivenessIdentity,
    interval: Duration,
    now: DateTime<Utc>,
) -> Result<(), SyncError> {
    let at = sql_timestamp(now);
    let uptime_step = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        INSERT INTO bot_status (bot_name, status, last_ping, uptime_seconds)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(bot_name) DO UPDATE SET
            status = excluded.status,
            last_ping = excluded.last_ping,
            uptime_seconds = bot_status.uptime_seconds + excluded.uptime_seconds
        "#,
        params![identity.bot_name, LivenessStatus::Up.as_str(), at, uptime_step],
    )?;

    tx.execute(
        r#"
        INSERT INTO lm_machines (ip, status, last_heartbeat)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(ip) DO UPDATE SET
            status = excluded.status,
            last_heartbeat = excluded.last_heartbeat
        "#,
        params![identity.node_id, LivenessStatus::Online.as_str(), at],
    )?;

    tx.commit()?;
    log::debug!("💓 Bot status updated ({})", identity.node_id);
    Ok(())
}

/// Mark the node down on graceful shutdown; uptime is left as is
pub fn mark_offline(
    conn: &mut Connection,
    identity: &LivenessIdentity,
    now: DateTime<Utc>,
) -> Result<(), SyncError> {
    let at = sql_timestamp(now);
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE bot_status SET status = ?1, last_ping = ?2 WHERE bot_name = ?3",
        params![LivenessStatus::Down.as_str(), at, identity.bot_name],
    )?;
    tx.execute(
        "UPDATE lm_machines SET status = ?1 WHERE ip = ?2",
        params![LivenessStatus::Offline.as_str(), identity.node_id],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn bot_liveness(conn: &Connection, bot_name: &str) -> Result<Option<LivenessRecord>, SyncError> {
    let row = conn
        .query_row(
            "SELECT bot_name, status, last_ping, uptime_seconds FROM bot_status WHERE bot_name = ?1",
            [bot_name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((bot_name, status, last_ping, uptime_seconds)) = row else {
        return Ok(None);
    };
    let status = LivenessStatus::parse(&status)
        .ok_or_else(|| SyncError::malformed(&bot_name, format!("unknown status {}", status)))?;

    Ok(Some(LivenessRecord {
        bot_name,
        status,
        last_heartbeat: last_ping.as_deref().and_then(parse_sql_timestamp),
        uptime_seconds,
    }))
}
