//! Reconciliation engine
//!
//! Per cycle: feed → ingest → local store → select → coordinator push, then
//! heartbeat and retention, all driven by [`scheduler::SyncScheduler`].

pub mod feed;
pub mod ingest;
pub mod liveness;
pub mod retention;
pub mod scheduler;
pub mod selector;
pub mod types;
pub mod upserter;

pub use feed::{FeedTicker, HttpPriceFeed, PriceFeed};
pub use ingest::{ingest, IngestReport};
pub use liveness::{heartbeat, mark_offline, LivenessIdentity};
pub use retention::{sweep, RetentionPolicy, SweepReport};
pub use scheduler::{CycleReport, CycleState, SyncScheduler};
pub use selector::{select_signals, top_signals, SelectionPolicy};
pub use types::{
    LivenessRecord, LivenessStatus, NumericField, SignalCacheEntry, SignalRecord,
    SyncAuditRecord, TickerRecord, TickerSnapshot,
};
pub use upserter::{CoordinatorStore, PushReport, RemoteUpserter};
