//! Cycle Scheduler
//!
//! Drives one node's reconciliation loop:
//!
//! IDLE → INGESTING → SELECTING → PUSHING → REPORTING → SWEEPING → SLEEPING → IDLE
//!
//! Each step's failure is caught at its boundary and recorded in the [`CycleReport`];
//! the machine always advances. A panic inside an async step becomes an unexpected
//! failure of that step; a panic anywhere else aborts the cycle, which `run` reports
//! and follows with the failure backoff. A stop request is honored between steps
//! and interrupts the sleep, never a step in progress.

use super::feed::PriceFeed;
use super::ingest::{ingest, IngestReport};
use super::liveness::{heartbeat, mark_offline, LivenessIdentity};
use super::retention::{sweep, RetentionPolicy, SweepReport};
use super::selector::{select_signals, top_signals, SelectionPolicy};
use super::types::SignalRecord;
use super::upserter::{mirror_audit, PushReport, RemoteUpserter};
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::config::SyncConfig;
use crate::error::{ErrorClass, SyncError};
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Ingesting,
    Selecting,
    Pushing,
    Reporting,
    Sweeping,
    Sleeping,
    Stopped,
}

/// Outcome of every step of one cycle; `None` means the step did not run
#[derive(Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ingest: Option<Result<IngestReport, SyncError>>,
    /// Number of signals selected for the push
    pub selected: Option<Result<usize, SyncError>>,
    pub push: Option<Result<PushReport, SyncError>>,
    /// Copy of the coordinator audit row into the local `sync_log`
    pub audit_mirror: Option<Result<(), SyncError>>,
    pub heartbeat: Option<Result<(), SyncError>>,
    pub sweep: Option<Result<SweepReport, SyncError>>,
    /// Failure raised outside any step; the rest of the cycle was lost
    pub aborted: Option<SyncError>,
    /// Cycle was cut short by a stop request
    pub stopped: bool,
}

impl CycleReport {
    fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            ingest: None,
            selected: None,
            push: None,
            audit_mirror: None,
            heartbeat: None,
            sweep: None,
            aborted: None,
            stopped: false,
        }
    }

    /// Step failures in step order
    pub fn errors(&self) -> impl Iterator<Item = &SyncError> + '_ {
        [
            self.ingest.as_ref().and_then(|r| r.as_ref().err()),
            self.selected.as_ref().and_then(|r| r.as_ref().err()),
            self.push.as_ref().and_then(|r| r.as_ref().err()),
            self.audit_mirror.as_ref().and_then(|r| r.as_ref().err()),
            self.heartbeat.as_ref().and_then(|r| r.as_ref().err()),
            self.sweep.as_ref().and_then(|r| r.as_ref().err()),
            self.aborted.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn has_local_failure(&self) -> bool {
        self.errors().any(SyncError::is_local)
    }

    pub fn has_unexpected_failure(&self) -> bool {
        self.errors().any(|e| e.class() == ErrorClass::Unexpected)
    }

    /// Signals applied on the coordinator this cycle
    pub fn synced(&self) -> usize {
        match &self.push {
            Some(Ok(report)) => report.applied,
            _ => 0,
        }
    }

    pub fn tickers_updated(&self) -> usize {
        match &self.ingest {
            Some(Ok(report)) => report.updated,
            _ => 0,
        }
    }

    /// Move the first local-store failure out of the report
    pub fn take_local_failure(&mut self) -> Option<SyncError> {
        take_local(&mut self.ingest)
            .or_else(|| take_local(&mut self.selected))
            .or_else(|| take_local(&mut self.push))
            .or_else(|| take_local(&mut self.audit_mirror))
            .or_else(|| take_local(&mut self.heartbeat))
            .or_else(|| take_local(&mut self.sweep))
    }
}

fn take_local<T>(slot: &mut Option<Result<T, SyncError>>) -> Option<SyncError> {
    match slot.take() {
        Some(Err(e)) if e.is_local() => Some(e),
        other => {
            *slot = other;
            None
        }
    }
}

/// One node's reconciliation loop
pub struct SyncScheduler {
    config: SyncConfig,
    store: LocalStore,
    feed: Arc<dyn PriceFeed>,
    upserter: RemoteUpserter,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    stop: watch::Receiver<bool>,
    state: CycleState,
    cycles: u64,
    local_failures: u32,
}

impl SyncScheduler {
    /// Arguments:
    /// - `config`: Node configuration (coordinator location, intervals, limits)
    /// - `store`: Opened local store
    /// - `feed`: Price feed polled once per cycle
    /// - `stop`: Set to `true` to stop at the next step boundary
    pub fn new(
        config: SyncConfig,
        store: LocalStore,
        feed: Arc<dyn PriceFeed>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let upserter = RemoteUpserter::new(
            config.coordinator_db.clone(),
            config.coordinator_timeout,
            config.sources_mode,
        )
        .with_push_timeout(config.coordinator_push_timeout);
        Self {
            config,
            store,
            feed,
            upserter,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            stop,
            state: CycleState::Idle,
            cycles: 0,
            local_failures: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Cycles that got past the stop check
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            max_age: self.config.signal_max_age,
            limit: self.config.batch_limit,
            statuses: self.config.signal_statuses.clone(),
        }
    }

    fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            price_history: self.config.price_history_retention,
            sync_log: self.config.sync_log_retention,
        }
    }

    fn identity(&self) -> LivenessIdentity {
        LivenessIdentity {
            bot_name: self.config.bot_name.clone(),
            node_id: self.config.node_id.clone(),
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Move to `next` unless a stop was requested
    fn advance(&mut self, next: CycleState) -> bool {
        if self.stop_requested() {
            log::debug!("🛑 Stop requested before {:?}", next);
            self.state = CycleState::Stopped;
            return false;
        }
        log::debug!("   ├─ {:?} → {:?}", self.state, next);
        self.state = next;
        true
    }

    /// Run every step once, stopping early only on a stop request
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::new(self.cycles + 1, self.clock.now());

        if !self.advance(CycleState::Ingesting) {
            report.stopped = true;
            return report;
        }
        self.cycles += 1;
        let ingested = guarded(
            "price ingestion",
            ingest(
                self.feed.as_ref(),
                &self.store,
                &self.config.node_id,
                self.config.ticker_mode,
                self.clock.now(),
            ),
        )
        .await;
        report.ingest = Some(logged("price ingestion", ingested));

        if !self.advance(CycleState::Selecting) {
            report.stopped = true;
            return report;
        }
        let policy = self.selection_policy();
        let now = self.clock.now();
        let batch = self
            .store
            .with_conn(|conn| select_signals(conn, &policy, now));
        let batch: Option<Vec<SignalRecord>> = match logged("signal selection", batch) {
            Ok(batch) => {
                report.selected = Some(Ok(batch.len()));
                Some(batch)
            }
            Err(e) => {
                report.selected = Some(Err(e));
                None
            }
        };

        if !self.advance(CycleState::Pushing) {
            report.stopped = true;
            return report;
        }
        if let Some(batch) = batch {
            let pushed = guarded(
                "coordinator push",
                self.upserter.push(batch, &self.config.node_id, self.clock.now()),
            )
            .await;
            if let Ok(PushReport {
                audit: Some(audit), ..
            }) = &pushed
            {
                let mirrored = self.store.with_conn(|conn| mirror_audit(conn, audit));
                report.audit_mirror = Some(logged("local audit mirror", mirrored));
            }
            report.push = Some(logged("coordinator push", pushed));
        }

        if !self.advance(CycleState::Reporting) {
            report.stopped = true;
            return report;
        }
        let identity = self.identity();
        let interval = self.config.poll_interval;
        let now = self.clock.now();
        let beat = self
            .store
            .with_conn(|conn| heartbeat(conn, &identity, interval, now));
        if let Err(e) = &beat {
            log::error!("❌ Heartbeat failed: {}", e);
        }
        report.heartbeat = Some(beat);

        if !self.advance(CycleState::Sweeping) {
            report.stopped = true;
            return report;
        }
        let retention = self.retention_policy();
        let now = self.clock.now();
        let swept = self.store.with_conn(|conn| sweep(conn, &retention, now));
        report.sweep = Some(logged("retention sweep", swept));

        self.log_summary(&report);
        report
    }

    fn log_summary(&self, report: &CycleReport) {
        let failed = report.errors().count();
        log::info!(
            "✅ Cycle {}: {} tickers, {} signals synced{}",
            report.cycle,
            report.tickers_updated(),
            report.synced(),
            if failed > 0 {
                format!(" ({} steps failed)", failed)
            } else {
                String::new()
            }
        );

        if self.config.top_signals == 0 {
            return;
        }
        let policy = self.selection_policy();
        let now = self.clock.now();
        let n = self.config.top_signals;
        match self.store.with_conn(|conn| top_signals(conn, &policy, n, now)) {
            Ok(top) if !top.is_empty() => {
                log::info!("🏆 Top signals:");
                for (i, signal) in top.iter().enumerate() {
                    let branch = if i + 1 == top.len() { "└─" } else { "├─" };
                    let score = signal
                        .score
                        .as_f64()
                        .map(|s| format!("{:.1}", s))
                        .unwrap_or_else(|| "?".to_string());
                    log::info!(
                        "   {} {} {} (score {})",
                        branch,
                        signal.symbol,
                        signal.direction,
                        score
                    );
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("⚠️  Top signals unavailable: {}", e),
        }
    }

    /// Pause before the next cycle
    ///
    /// A cycle that hit an unexpected failure waits the shorter backoff.
    pub fn next_pause(&self, report: &CycleReport) -> Duration {
        if report.has_unexpected_failure() {
            self.config.failure_backoff
        } else {
            self.config.poll_interval
        }
    }

    /// Sleep unless stopped first; returns false when the sleep was cut short
    async fn pause(&mut self, duration: Duration) -> bool {
        if !self.advance(CycleState::Sleeping) {
            return false;
        }
        let sleeper = Arc::clone(&self.sleeper);
        let completed = tokio::select! {
            _ = sleeper.sleep(duration) => true,
            _ = wait_for_stop(&mut self.stop) => false,
        };
        if completed {
            self.state = CycleState::Idle;
        } else {
            self.state = CycleState::Stopped;
        }
        completed
    }

    /// Loop until stopped
    ///
    /// Returns an error only when the local store has failed for
    /// `max_local_failures` consecutive cycles.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        log::info!("🚀 Sync node starting");
        log::info!("   ├─ Node: {} ({})", self.config.node_id, self.config.bot_name);
        log::info!("   ├─ Coordinator: {}", self.upserter.location().display());
        log::info!("   ├─ Feed: {} ({})", self.config.feed_exchange, self.config.feed_url);
        log::info!("   └─ Interval: {}s", self.config.poll_interval.as_secs());

        loop {
            let cycle = self.cycles + 1;
            let outcome = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
            let mut report = match outcome {
                Ok(report) => report,
                Err(payload) => self.aborted_cycle(cycle, payload.as_ref()),
            };

            if report.has_local_failure() {
                self.local_failures += 1;
                if self.local_failures >= self.config.max_local_failures {
                    log::error!(
                        "❌ Local store failed {} cycles in a row, giving up",
                        self.local_failures
                    );
                    self.state = CycleState::Stopped;
                    return Err(report
                        .take_local_failure()
                        .unwrap_or(SyncError::LocalStorePoisoned));
                }
            } else {
                self.local_failures = 0;
            }

            if report.stopped {
                break;
            }
            let pause = self.next_pause(&report);
            if report.has_unexpected_failure() {
                log::warn!("⚠️  Backing off {}s after unexpected failure", pause.as_secs());
            }
            if !self.pause(pause).await {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Report for a cycle that panicked outside any step
    fn aborted_cycle(&mut self, cycle: u64, payload: &(dyn Any + Send)) -> CycleReport {
        let err = SyncError::Unexpected(format!(
            "cycle {} panicked: {}",
            cycle,
            panic_message(payload)
        ));
        log::error!("❌ Cycle aborted: {}", err);
        self.state = CycleState::Idle;

        let mut report = CycleReport::new(cycle, self.clock.now());
        report.aborted = Some(err);
        report
    }

    fn shutdown(&mut self) {
        self.state = CycleState::Stopped;
        let identity = self.identity();
        let now = self.clock.now();
        match self
            .store
            .with_conn(|conn| mark_offline(conn, &identity, now))
        {
            Ok(()) => log::info!("✅ Sync node stopped ({} cycles)", self.cycles),
            Err(e) => log::error!("❌ Failed to mark node offline: {}", e),
        }
    }
}

/// Resolves once the stop flag is set; never resolves if the sender is gone
async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run an async step, turning a panic into an unexpected failure of that step
async fn guarded<T>(
    step: &str,
    work: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(SyncError::Unexpected(format!(
            "{} panicked: {}",
            step,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn logged<T>(step: &str, result: Result<T, SyncError>) -> Result<T, SyncError> {
    if let Err(e) = &result {
        match e.class() {
            ErrorClass::Transient | ErrorClass::DataShape => {
                log::warn!("⚠️  {} failed: {}", step, e)
            }
            ErrorClass::LocalResource | ErrorClass::Unexpected => {
                log::error!("❌ {} failed: {}", step, e)
            }
        }
    }
    result
}
