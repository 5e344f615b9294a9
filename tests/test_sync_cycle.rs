//! End-to-end cycles against real SQLite files
//!
//! Each test provisions a coordinator and one or more node databases in a temp dir,
//! then drives `SyncScheduler` with a static feed and a fixed clock.

#[cfg(test)]
mod sync_cycle_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rusqlite::{params, Connection};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::watch;
    use tradesync::clock::{sql_timestamp, Clock, ManualClock, Sleeper};
    use tradesync::reconcile::ingest::cached_ticker;
    use tradesync::reconcile::liveness::bot_liveness;
    use tradesync::reconcile::{
        CoordinatorStore, FeedTicker, LivenessStatus, PriceFeed, SyncScheduler, TickerSnapshot,
    };
    use tradesync::store::schema::{provision, SchemaKind};
    use tradesync::store::LocalStore;
    use tradesync::{SyncConfig, SyncError};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// Feed whose snapshot can be swapped between cycles
    struct ScriptedFeed {
        tickers: Mutex<Vec<FeedTicker>>,
    }

    impl ScriptedFeed {
        fn new(tickers: Vec<FeedTicker>) -> Arc<Self> {
            Arc::new(Self {
                tickers: Mutex::new(tickers),
            })
        }

        fn set(&self, tickers: Vec<FeedTicker>) {
            *self.tickers.lock().unwrap() = tickers;
        }
    }

    #[async_trait]
    impl PriceFeed for ScriptedFeed {
        fn exchange(&self) -> &str {
            "MEXC"
        }

        async fn fetch(&self) -> Result<Vec<FeedTicker>, SyncError> {
            Ok(self.tickers.lock().unwrap().clone())
        }
    }

    /// Advances the clock instead of waiting, stops after `stop_after` pauses
    struct FastForward {
        clock: Arc<ManualClock>,
        pauses: Mutex<Vec<Duration>>,
        stop_after: usize,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl Sleeper for FastForward {
        async fn sleep(&self, duration: Duration) {
            self.clock.advance(duration);
            let mut pauses = self.pauses.lock().unwrap();
            pauses.push(duration);
            if pauses.len() >= self.stop_after {
                let _ = self.stop.send(true);
            }
        }
    }

    fn ticker(symbol: &str, last: f64) -> FeedTicker {
        FeedTicker::Valid(TickerSnapshot {
            symbol: symbol.to_string(),
            last_price: last,
            high_24h: last * 1.02,
            low_24h: last * 0.98,
            change_24h: 0.5,
            volume_24h: 1_000.0,
        })
    }

    struct Cluster {
        dir: TempDir,
        coordinator: PathBuf,
    }

    impl Cluster {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let coordinator = dir.path().join("SQL3_MASTER.db");
            provision(&coordinator, SchemaKind::Coordinator).unwrap();
            Self { dir, coordinator }
        }

        fn node_db(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(format!("{}.db", name));
            provision(&path, SchemaKind::Local).unwrap();
            path
        }

        fn coordinator(&self) -> CoordinatorStore {
            CoordinatorStore::open(&self.coordinator, Duration::from_secs(1)).unwrap()
        }
    }

    fn insert_signal(path: &Path, symbol: &str, score: f64, created_at: DateTime<Utc>) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "INSERT INTO trading_signals (symbol, direction, score, entry_price, sl, status, created_at)
             VALUES (?1, 'LONG', ?2, 100.0, 95.0, 'PENDING', ?3)",
            params![symbol, score, sql_timestamp(created_at)],
        )
        .unwrap();
    }

    fn node(
        local: &Path,
        coordinator: &Path,
        node_id: &str,
        feed: Arc<ScriptedFeed>,
        clock: Arc<ManualClock>,
        stop_after: usize,
    ) -> (SyncScheduler, LocalStore, Arc<FastForward>) {
        let (tx, rx) = watch::channel(false);
        let mut config = SyncConfig::new(local, coordinator);
        config.node_id = node_id.to_string();
        config.coordinator_timeout = Duration::from_secs(5);

        let store = LocalStore::open(local).unwrap();
        let sleeper = Arc::new(FastForward {
            clock: clock.clone(),
            pauses: Mutex::new(Vec::new()),
            stop_after,
            stop: tx,
        });
        let scheduler = SyncScheduler::new(config, store.clone(), feed, rx)
            .with_clock(clock)
            .with_sleeper(sleeper.clone());
        (scheduler, store, sleeper)
    }

    #[tokio::test]
    async fn test_btc_ticker_replaced_across_cycles() {
        let cluster = Cluster::new();
        let local = cluster.node_db("node_a");
        let clock = Arc::new(ManualClock::new(start()));
        let feed = ScriptedFeed::new(vec![ticker("BTC_USDT", 65_000.0)]);
        let (mut scheduler, store, _) =
            node(&local, &cluster.coordinator, "192.168.1.85", feed.clone(), clock.clone(), 10);

        scheduler.run_cycle().await;
        feed.set(vec![ticker("BTC_USDT", 66_000.0)]);
        clock.advance(Duration::from_secs(120));
        scheduler.run_cycle().await;

        let (rows, row) = store
            .with_conn(|conn| {
                let rows: i64 =
                    conn.query_row("SELECT COUNT(*) FROM tickers_cache", [], |row| row.get(0))?;
                Ok((rows, cached_ticker(conn, "BTC_USDT", "MEXC")?))
            })
            .unwrap();
        let row = row.unwrap();
        assert_eq!(rows, 1);
        assert_eq!(row.last_price, 66_000.0);
        assert_eq!(row.observed_at, "2026-03-01 12:02:00");
    }

    #[tokio::test]
    async fn test_twenty_five_fresh_signals_push_top_twenty() {
        let cluster = Cluster::new();
        let local = cluster.node_db("node_a");
        for score in 1..=25 {
            insert_signal(
                &local,
                &format!("S{:02}_USDT", score),
                score as f64,
                start() - ChronoDuration::minutes(10),
            );
        }
        let clock = Arc::new(ManualClock::new(start()));
        let (mut scheduler, _, _) = node(
            &local,
            &cluster.coordinator,
            "192.168.1.85",
            ScriptedFeed::new(Vec::new()),
            clock,
            10,
        );

        let report = scheduler.run_cycle().await;

        assert_eq!(report.synced(), 20);
        let coordinator = cluster.coordinator();
        assert!(coordinator.entry("S06_USDT").unwrap().is_some());
        assert!(coordinator.entry("S05_USDT").unwrap().is_none());
        let audit = coordinator.audit_log().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].records_synced, 20);
        assert_eq!(audit[0].machine_ip, "192.168.1.85");
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_retried_next_cycle() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("node_a.db");
        provision(&local, SchemaKind::Local).unwrap();
        insert_signal(&local, "ETH_USDT", 80.0, start() - ChronoDuration::minutes(5));
        let coordinator = dir.path().join("share").join("SQL3_MASTER.db");

        let clock = Arc::new(ManualClock::new(start()));
        let (mut scheduler, store, _) = node(
            &local,
            &coordinator,
            "192.168.1.85",
            ScriptedFeed::new(vec![ticker("ETH_USDT", 3_200.0)]),
            clock.clone(),
            10,
        );

        let report = scheduler.run_cycle().await;
        assert!(matches!(report.push, Some(Err(ref e)) if e.is_transient()));
        assert_eq!(report.synced(), 0);
        assert_eq!(report.tickers_updated(), 1);
        let bot = store
            .with_conn(|conn| bot_liveness(conn, "TRADING_AI_v9"))
            .unwrap()
            .unwrap();
        assert_eq!(bot.status, LivenessStatus::Up);

        // Share comes back
        std::fs::create_dir_all(coordinator.parent().unwrap()).unwrap();
        provision(&coordinator, SchemaKind::Coordinator).unwrap();
        clock.advance(Duration::from_secs(120));

        let report = scheduler.run_cycle().await;
        assert_eq!(report.synced(), 1);
        let master = CoordinatorStore::open(&coordinator, Duration::from_secs(1)).unwrap();
        assert_eq!(master.audit_log().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_two_nodes_last_write_wins() {
        let cluster = Cluster::new();
        let node_a = cluster.node_db("node_a");
        let node_b = cluster.node_db("node_b");
        insert_signal(&node_a, "SOL_USDT", 70.0, start() - ChronoDuration::minutes(3));
        insert_signal(&node_b, "SOL_USDT", 90.0, start() - ChronoDuration::minutes(1));
        let clock = Arc::new(ManualClock::new(start()));

        let (mut a, _, _) = node(
            &node_a,
            &cluster.coordinator,
            "192.168.1.85",
            ScriptedFeed::new(Vec::new()),
            clock.clone(),
            10,
        );
        let (mut b, _, _) = node(
            &node_b,
            &cluster.coordinator,
            "192.168.1.113",
            ScriptedFeed::new(Vec::new()),
            clock.clone(),
            10,
        );

        a.run_cycle().await;
        b.run_cycle().await;

        let coordinator = cluster.coordinator();
        let sol = coordinator.entry("SOL_USDT").unwrap().unwrap();
        assert_eq!(sol.score, 90.0);
        assert_eq!(sol.sources, vec!["192.168.1.113"]);
        let audit = coordinator.audit_log().unwrap();
        let machines: Vec<&str> = audit.iter().map(|r| r.machine_ip.as_str()).collect();
        assert_eq!(machines, vec!["192.168.1.85", "192.168.1.113"]);
    }

    #[tokio::test]
    async fn test_run_until_stop_marks_node_offline() {
        let cluster = Cluster::new();
        let local = cluster.node_db("node_a");
        let clock = Arc::new(ManualClock::new(start()));
        let (mut scheduler, store, sleeper) = node(
            &local,
            &cluster.coordinator,
            "192.168.1.85",
            ScriptedFeed::new(vec![ticker("BTC_USDT", 65_000.0)]),
            clock.clone(),
            3,
        );

        scheduler.run().await.unwrap();

        assert_eq!(scheduler.cycles(), 3);
        assert_eq!(sleeper.pauses.lock().unwrap().len(), 3);
        assert_eq!(clock.now(), start() + ChronoDuration::seconds(360));

        let bot = store
            .with_conn(|conn| bot_liveness(conn, "TRADING_AI_v9"))
            .unwrap()
            .unwrap();
        assert_eq!(bot.status, LivenessStatus::Down);
        assert_eq!(bot.uptime_seconds, 360);

        let machine: String = Connection::open(&local)
            .unwrap()
            .query_row(
                "SELECT status FROM lm_machines WHERE ip = '192.168.1.85'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(machine, "OFFLINE");
    }

    #[tokio::test]
    async fn test_retention_prunes_old_history() {
        let cluster = Cluster::new();
        let local = cluster.node_db("node_a");
        {
            let conn = Connection::open(&local).unwrap();
            conn.execute(
                "INSERT INTO price_history (symbol, exchange, last_price, observed_at)
                 VALUES ('BTC_USDT', 'MEXC', 60000, ?1)",
                params![sql_timestamp(start() - ChronoDuration::hours(30))],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO sync_log (machine_ip, action, records_synced, timestamp)
                 VALUES ('192.168.1.85', 'SIGNAL_SYNC', 2, ?1)",
                params![sql_timestamp(start() - ChronoDuration::days(8))],
            )
            .unwrap();
        }
        let clock = Arc::new(ManualClock::new(start()));
        let (mut scheduler, _, _) = node(
            &local,
            &cluster.coordinator,
            "192.168.1.85",
            ScriptedFeed::new(Vec::new()),
            clock,
            10,
        );

        let report = scheduler.run_cycle().await;

        let swept = report.sweep.unwrap().unwrap();
        assert_eq!(swept.price_history_deleted, 1);
        assert_eq!(swept.sync_log_deleted, 1);
    }
}
