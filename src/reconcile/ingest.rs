//! Price Ingestor: feed snapshot → local ticker tables
//!
//! Tables written:
//! - `tickers_cache` - INSERT OR REPLACE on (symbol, exchange)
//! - `price_history` - INSERT (append-only, pruned by the sweeper)
//!
//! One transaction per cycle. A ticker the database refuses (constraint, conversion)
//! is skipped and the rest of the snapshot still commits. A store-level fault
//! (busy, locked, missing table) rolls the whole snapshot back.

use super::feed::{FeedTicker, PriceFeed};
use super::types::{TickerRecord, TickerSnapshot};
use crate::clock::sql_timestamp;
use crate::config::TickerMode;
use crate::error::{is_row_level, SyncError};
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

/// Where and how a snapshot is written
#[derive(Debug, Clone)]
pub struct IngestTarget<'a> {
    pub exchange: &'a str,
    pub node_id: &'a str,
    pub mode: TickerMode,
}

/// Outcome of one ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Tickers written (a ticker counts once even when written to both tables)
    pub updated: usize,
    /// Entries dropped: malformed on the feed or rejected by the database
    pub skipped: usize,
}

/// Fetch the feed once and merge the snapshot into the local store
///
/// Feed failures come back as typed errors and nothing is written.
pub async fn ingest(
    feed: &dyn PriceFeed,
    store: &LocalStore,
    node_id: &str,
    mode: TickerMode,
    now: DateTime<Utc>,
) -> Result<IngestReport, SyncError> {
    log::debug!("📡 Fetching {} tickers...", feed.exchange());
    let tickers = feed.fetch().await?;

    if tickers.is_empty() {
        log::warn!("⚠️  No tickers received from {}", feed.exchange());
        return Ok(IngestReport::default());
    }

    let target = IngestTarget {
        exchange: feed.exchange(),
        node_id,
        mode,
    };
    store.with_conn(|conn| store_snapshot(conn, &tickers, &target, now))
}

/// Write a snapshot in a single transaction
pub fn store_snapshot(
    conn: &mut Connection,
    tickers: &[FeedTicker],
    target: &IngestTarget<'_>,
    now: DateTime<Utc>,
) -> Result<IngestReport, SyncError> {
    let observed_at = sql_timestamp(now);
    let tx = conn.transaction()?;
    let mut report = IngestReport::default();

    for ticker in tickers {
        let snapshot = match ticker {
            FeedTicker::Valid(snapshot) => snapshot,
            FeedTicker::Malformed { reason } => {
                log::debug!("⚠️  Skipping ticker: {}", reason);
                report.skipped += 1;
                continue;
            }
        };

        match write_ticker(&tx, snapshot, target, &observed_at) {
            Ok(()) => report.updated += 1,
            Err(e) if is_row_level(&e) => {
                log::debug!("⚠️  Ticker {} not written: {}", snapshot.symbol, e);
                report.skipped += 1;
            }
            Err(e) => return Err(SyncError::LocalStore(e)),
        }
    }

    tx.commit()?;

    log::info!(
        "💰 Updated {} {} tickers ({} skipped)",
        report.updated,
        target.exchange,
        report.skipped
    );
    Ok(report)
}

fn write_ticker(
    tx: &Transaction<'_>,
    snapshot: &TickerSnapshot,
    target: &IngestTarget<'_>,
    observed_at: &str,
) -> rusqlite::Result<()> {
    let values = params![
        snapshot.symbol,
        target.exchange,
        snapshot.last_price,
        snapshot.high_24h,
        snapshot.low_24h,
        snapshot.change_24h,
        snapshot.volume_24h,
        observed_at,
        target.node_id,
    ];

    if target.mode.writes_cache() {
        tx.execute(
            r#"
            INSERT OR REPLACE INTO tickers_cache
                (symbol, exchange, last_price, high_24h, low_24h, change_24h, volume_24h,
                 updated_at, source_node)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            values,
        )?;
    }

    if target.mode.writes_history() {
        tx.execute(
            r#"
            INSERT INTO price_history
                (symbol, exchange, last_price, high_24h, low_24h, change_24h, volume_24h,
                 observed_at, source_node)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            values,
        )?;
    }

    Ok(())
}

/// Current cached ticker for (symbol, exchange)
pub fn cached_ticker(
    conn: &Connection,
    symbol: &str,
    exchange: &str,
) -> Result<Option<TickerRecord>, SyncError> {
    let record = conn
        .query_row(
            r#"
            SELECT symbol, exchange, last_price, high_24h, low_24h, change_24h, volume_24h,
                   updated_at, source_node
            FROM tickers_cache
            WHERE symbol = ?1 AND exchange = ?2
            "#,
            params![symbol, exchange],
            |row| {
                Ok(TickerRecord {
                    symbol: row.get(0)?,
                    exchange: row.get(1)?,
                    last_price: row.get(2)?,
                    high_24h: row.get(3)?,
                    low_24h: row.get(4)?,
                    change_24h: row.get(5)?,
                    volume_24h: row.get(6)?,
                    observed_at: row.get(7)?,
                    source_node: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::apply_local_schema;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn test_store() -> LocalStore {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_local_schema(&mut conn).unwrap();
        LocalStore::from_connection(conn)
    }

    fn btc(last: f64) -> FeedTicker {
        FeedTicker::Valid(TickerSnapshot {
            symbol: "BTC_USDT".to_string(),
            last_price: last,
            high_24h: 66000.0,
            low_24h: 64000.0,
            change_24h: 1.5,
            volume_24h: 1000.0,
        })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn count(store: &LocalStore, table: &str) -> i64 {
        store
            .with_conn(|conn| {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap()
    }

    struct StaticFeed(Result<Vec<FeedTicker>, u16>);

    #[async_trait]
    impl PriceFeed for StaticFeed {
        fn exchange(&self) -> &str {
            "MEXC"
        }

        async fn fetch(&self) -> Result<Vec<FeedTicker>, SyncError> {
            self.0.clone().map_err(SyncError::FeedStatus)
        }
    }

    #[tokio::test]
    async fn test_replace_mode_keeps_one_row_per_symbol() {
        let store = test_store();

        let first = StaticFeed(Ok(vec![btc(65000.0)]));
        let report = ingest(&first, &store, "node-a", TickerMode::Replace, now())
            .await
            .unwrap();
        assert_eq!(report.updated, 1);

        let row = store
            .with_conn(|conn| cached_ticker(conn, "BTC_USDT", "MEXC"))
            .unwrap()
            .unwrap();
        assert_eq!(row.last_price, 65000.0);
        assert_eq!(row.observed_at, "2026-03-01 12:00:00");
        assert_eq!(row.source_node.as_deref(), Some("node-a"));

        let second = StaticFeed(Ok(vec![btc(66000.0)]));
        ingest(&second, &store, "node-a", TickerMode::Replace, now())
            .await
            .unwrap();

        assert_eq!(count(&store, "tickers_cache"), 1);
        assert_eq!(count(&store, "price_history"), 0);
        let row = store
            .with_conn(|conn| cached_ticker(conn, "BTC_USDT", "MEXC"))
            .unwrap()
            .unwrap();
        assert_eq!(row.last_price, 66000.0);
    }

    #[tokio::test]
    async fn test_same_snapshot_twice_is_idempotent() {
        let store = test_store();
        let feed = StaticFeed(Ok(vec![btc(65000.0)]));

        ingest(&feed, &store, "node-a", TickerMode::Replace, now()).await.unwrap();
        let once = store
            .with_conn(|conn| cached_ticker(conn, "BTC_USDT", "MEXC"))
            .unwrap();
        ingest(&feed, &store, "node-a", TickerMode::Replace, now()).await.unwrap();
        let twice = store
            .with_conn(|conn| cached_ticker(conn, "BTC_USDT", "MEXC"))
            .unwrap();

        assert_eq!(once, twice);
        assert_eq!(count(&store, "tickers_cache"), 1);
    }

    #[tokio::test]
    async fn test_history_mode_appends() {
        let store = test_store();
        let feed = StaticFeed(Ok(vec![btc(65000.0)]));

        ingest(&feed, &store, "node-a", TickerMode::History, now()).await.unwrap();
        ingest(&feed, &store, "node-a", TickerMode::History, now()).await.unwrap();

        assert_eq!(count(&store, "price_history"), 2);
        assert_eq!(count(&store, "tickers_cache"), 0);
    }

    #[tokio::test]
    async fn test_both_mode_counts_ticker_once() {
        let store = test_store();
        let feed = StaticFeed(Ok(vec![btc(65000.0)]));

        let report = ingest(&feed, &store, "node-a", TickerMode::Both, now()).await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(count(&store, "price_history"), 1);
        assert_eq!(count(&store, "tickers_cache"), 1);
    }

    #[tokio::test]
    async fn test_malformed_ticker_skipped() {
        let store = test_store();
        let feed = StaticFeed(Ok(vec![
            FeedTicker::Malformed {
                reason: "ticker has no symbol".to_string(),
            },
            btc(65000.0),
        ]));

        let report = ingest(&feed, &store, "node-a", TickerMode::Replace, now())
            .await
            .unwrap();

        assert_eq!(report, IngestReport { updated: 1, skipped: 1 });
        assert_eq!(count(&store, "tickers_cache"), 1);
    }

    #[tokio::test]
    async fn test_feed_failure_writes_nothing() {
        let store = test_store();
        let feed = StaticFeed(Err(503));

        let result = ingest(&feed, &store, "node-a", TickerMode::Replace, now()).await;

        assert!(matches!(result, Err(SyncError::FeedStatus(503))));
        assert!(result.unwrap_err().is_transient());
        assert_eq!(count(&store, "tickers_cache"), 0);
    }

    #[tokio::test]
    async fn test_missing_table_is_local_failure() {
        let store = LocalStore::from_connection(Connection::open_in_memory().unwrap());
        let feed = StaticFeed(Ok(vec![btc(65000.0)]));

        let err = ingest(&feed, &store, "node-a", TickerMode::Replace, now())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LocalStore(_)));
        assert!(err.is_local());
    }

    #[tokio::test]
    async fn test_locked_store_is_local_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let mut conn = Connection::open(&path).unwrap();
        apply_local_schema(&mut conn).unwrap();
        conn.busy_timeout(std::time::Duration::from_millis(50)).unwrap();
        let store = LocalStore::from_connection(conn);

        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let feed = StaticFeed(Ok(vec![btc(65000.0), btc(65100.0)]));
        let err = ingest(&feed, &store, "node-a", TickerMode::Replace, now())
            .await
            .unwrap_err();
        assert!(err.is_local());

        holder.execute_batch("ROLLBACK").unwrap();
        assert_eq!(count(&store, "tickers_cache"), 0);
    }
}
