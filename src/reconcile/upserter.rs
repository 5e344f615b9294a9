//! Remote Upserter: selected signals → coordinator `signal_cache`
//!
//! The coordinator is a SQLite file that may sit on a network share and may be
//! unreachable at any moment. Opening it is bounded by a timeout and runs on the
//! blocking pool so a hung share cannot stall the node's loop.
//!
//! Per push that reaches the coordinator:
//! - each record is upserted on `symbol` (later record wins)
//! - records that fail coercion are skipped and reported
//! - exactly one `sync_log` row carries the number of rows actually applied
//! - upserts and the audit row commit together

use super::types::{SignalCacheEntry, SignalRecord, SyncAuditRecord, SIGNAL_SYNC_ACTION};
use crate::clock::sql_timestamp;
use crate::config::SourcesMode;
use crate::error::{is_row_level, SyncError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of a push
#[derive(Debug, Default)]
pub struct PushReport {
    /// Rows upserted into `signal_cache`
    pub applied: usize,
    /// Records skipped because they could not be coerced or were refused per row
    pub rejected: Vec<SyncError>,
    /// Audit row written on the coordinator; `None` when the coordinator was not contacted
    pub audit: Option<SyncAuditRecord>,
    /// Store fault that cut the batch short
    pub interrupted: Option<String>,
}

/// Open handle on the coordinator's database
pub struct CoordinatorStore {
    conn: Connection,
}

impl CoordinatorStore {
    /// Open an existing coordinator database
    ///
    /// The file is never created: a missing path means the share is not mounted or
    /// the coordinator is down. WAL is not enabled because it does not work over
    /// network filesystems.
    pub fn open(location: &Path, busy_timeout: Duration) -> Result<Self, SyncError> {
        let unreachable =
            |e: rusqlite::Error| SyncError::CoordinatorUnreachable(format!("{}: {}", location.display(), e));

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(location, flags).map_err(unreachable)?;
        conn.busy_timeout(busy_timeout).map_err(unreachable)?;

        // SQLite opens lazily; touch the schema so an unreadable file fails here
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('signal_cache', 'sync_log')",
                [],
                |row| row.get(0),
            )
            .map_err(unreachable)?;
        if tables != 2 {
            return Err(SyncError::CoordinatorUnreachable(format!(
                "{}: signal_cache/sync_log tables missing",
                location.display()
            )));
        }

        Ok(Self { conn })
    }

    /// Upsert a batch and append its audit row in one transaction
    pub fn apply_batch(
        &mut self,
        batch: &[SignalRecord],
        node_id: &str,
        mode: SourcesMode,
        now: DateTime<Utc>,
    ) -> Result<PushReport, SyncError> {
        let tx = self.conn.transaction().map_err(SyncError::Coordinator)?;
        let mut report = PushReport::default();

        for signal in batch {
            let mut entry = match SignalCacheEntry::from_signal(signal, node_id) {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("⚠️  Signal not synced: {}", e);
                    report.rejected.push(e);
                    continue;
                }
            };

            let written = match mode {
                SourcesMode::Overwrite => Ok(()),
                SourcesMode::Union => merge_sources(&tx, &mut entry),
            }
            .and_then(|()| upsert_entry(&tx, &entry));

            match written {
                Ok(()) => report.applied += 1,
                Err(e) if is_row_level(&e) => {
                    log::debug!("⚠️  Signal {} refused by coordinator: {}", entry.symbol, e);
                    report.rejected.push(SyncError::malformed(&entry.symbol, e.to_string()));
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  Coordinator fault after {} rows, keeping what was applied: {}",
                        report.applied,
                        e
                    );
                    report.interrupted = Some(e.to_string());
                    break;
                }
            }
        }

        let audit = SyncAuditRecord {
            machine_ip: node_id.to_string(),
            action: SIGNAL_SYNC_ACTION.to_string(),
            records_synced: report.applied as i64,
            timestamp: sql_timestamp(now),
        };
        append_audit(&tx, &audit).map_err(SyncError::Coordinator)?;
        tx.commit().map_err(SyncError::Coordinator)?;

        report.audit = Some(audit);
        Ok(report)
    }

    /// Current cache entry for `symbol`
    pub fn entry(&self, symbol: &str) -> Result<Option<SignalCacheEntry>, SyncError> {
        self.conn
            .query_row(
                "SELECT symbol, score, direction, sl, confidence, computed_at, sources
                 FROM signal_cache WHERE symbol = ?1",
                [symbol],
                |row| {
                    let sources: Option<String> = row.get(6)?;
                    Ok(SignalCacheEntry {
                        symbol: row.get(0)?,
                        score: row.get(1)?,
                        direction: row.get(2)?,
                        sl: row.get(3)?,
                        confidence: row.get(4)?,
                        computed_at: row.get(5)?,
                        sources: parse_sources(sources.as_deref()),
                    })
                },
            )
            .optional()
            .map_err(SyncError::Coordinator)
    }

    /// Audit rows, oldest first
    pub fn audit_log(&self) -> Result<Vec<SyncAuditRecord>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT machine_ip, action, records_synced, timestamp
                 FROM sync_log ORDER BY id ASC",
            )
            .map_err(SyncError::Coordinator)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SyncAuditRecord {
                    machine_ip: row.get(0)?,
                    action: row.get(1)?,
                    records_synced: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })
            .map_err(SyncError::Coordinator)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(SyncError::Coordinator)?;
        Ok(rows)
    }
}

/// Default bound on writing one batch after the coordinator opened
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Pushes batches to the coordinator at a fixed location
#[derive(Debug, Clone)]
pub struct RemoteUpserter {
    location: PathBuf,
    connect_timeout: Duration,
    push_timeout: Duration,
    sources_mode: SourcesMode,
}

impl RemoteUpserter {
    pub fn new(location: impl Into<PathBuf>, connect_timeout: Duration, sources_mode: SourcesMode) -> Self {
        Self {
            location: location.into(),
            connect_timeout,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            sources_mode,
        }
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Push a batch and return what happened
    ///
    /// An empty batch does not contact the coordinator. An unreachable coordinator
    /// or a connect timeout is a transient error: nothing was applied and no audit
    /// row exists. A write that outlives `push_timeout` is also reported as a
    /// timeout; its blocking worker may still commit later, and the next cycle
    /// upserts the same rows again.
    pub async fn push(
        &self,
        batch: Vec<SignalRecord>,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PushReport, SyncError> {
        if batch.is_empty() {
            log::info!("📭 No new signals to sync");
            return Ok(PushReport::default());
        }

        let location = self.location.clone();
        let busy_timeout = self.connect_timeout;
        let opening =
            tokio::task::spawn_blocking(move || CoordinatorStore::open(&location, busy_timeout));

        let mut store = match tokio::time::timeout(self.connect_timeout, opening).await {
            Err(_) => {
                return Err(SyncError::Timeout {
                    operation: "coordinator connect",
                    after: self.connect_timeout,
                })
            }
            Ok(Err(join_err)) => {
                return Err(SyncError::Unexpected(format!(
                    "coordinator connect task failed: {}",
                    join_err
                )))
            }
            Ok(Ok(opened)) => opened?,
        };

        let node_id = node_id.to_string();
        let mode = self.sources_mode;
        let writing =
            tokio::task::spawn_blocking(move || store.apply_batch(&batch, &node_id, mode, now));

        let report = match tokio::time::timeout(self.push_timeout, writing).await {
            Err(_) => {
                return Err(SyncError::Timeout {
                    operation: "coordinator push",
                    after: self.push_timeout,
                })
            }
            Ok(Err(join_err)) => {
                return Err(SyncError::Unexpected(format!(
                    "coordinator push task failed: {}",
                    join_err
                )))
            }
            Ok(Ok(applied)) => applied?,
        };

        log::info!(
            "📤 Synced {} signals to MASTER ({}), {} rejected",
            report.applied,
            self.location.display(),
            report.rejected.len()
        );
        Ok(report)
    }
}

fn upsert_entry(tx: &Transaction<'_>, entry: &SignalCacheEntry) -> rusqlite::Result<()> {
    let sources = serde_json::to_string(&entry.sources)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    tx.execute(
        r#"
        INSERT INTO signal_cache (symbol, score, direction, sl, confidence, computed_at, sources)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(symbol) DO UPDATE SET
            score = excluded.score,
            direction = excluded.direction,
            sl = excluded.sl,
            confidence = excluded.confidence,
            computed_at = excluded.computed_at,
            sources = excluded.sources
        "#,
        params![
            entry.symbol,
            entry.score,
            entry.direction,
            entry.sl,
            entry.confidence,
            entry.computed_at,
            sources,
        ],
    )?;
    Ok(())
}

/// Add the writer to whatever nodes already contributed this symbol
fn merge_sources(tx: &Transaction<'_>, entry: &mut SignalCacheEntry) -> rusqlite::Result<()> {
    let existing: Option<Option<String>> = tx
        .query_row(
            "SELECT sources FROM signal_cache WHERE symbol = ?1",
            [&entry.symbol],
            |row| row.get(0),
        )
        .optional()?;

    let mut merged = parse_sources(existing.flatten().as_deref());
    for node in entry.sources.drain(..) {
        if !merged.contains(&node) {
            merged.push(node);
        }
    }
    entry.sources = merged;
    Ok(())
}

/// Copy an audit row into the node's own `sync_log`
pub fn mirror_audit(local: &Connection, audit: &SyncAuditRecord) -> Result<(), SyncError> {
    append_audit(local, audit)?;
    Ok(())
}

fn append_audit(conn: &Connection, audit: &SyncAuditRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sync_log (machine_ip, action, records_synced, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![audit.machine_ip, audit.action, audit.records_synced, audit.timestamp],
    )?;
    Ok(())
}

/// `sources` column as a list; anything that is not a JSON string array is empty
fn parse_sources(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}
