//! Node configuration from environment variables
//!
//! Every address, path and interval the cycle needs lives in [`SyncConfig`], which is
//! handed to the scheduler at construction. Nothing downstream reads the environment.

use std::env;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_FEED_URL: &str = "https://contract.mexc.com/api/v1/contract/ticker";
pub const DEFAULT_BOT_NAME: &str = "TRADING_AI_v9";
const FALLBACK_NODE_ID: &str = "127.0.0.1";

/// How ingested tickers are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerMode {
    /// Replace the `tickers_cache` row per (symbol, exchange)
    Replace,
    /// Append every snapshot to `price_history`
    History,
    /// Both of the above in one transaction
    Both,
}

impl TickerMode {
    pub fn writes_cache(self) -> bool {
        matches!(self, TickerMode::Replace | TickerMode::Both)
    }

    pub fn writes_history(self) -> bool {
        matches!(self, TickerMode::History | TickerMode::Both)
    }
}

impl FromStr for TickerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(TickerMode::Replace),
            "history" | "historized" => Ok(TickerMode::History),
            "both" => Ok(TickerMode::Both),
            other => Err(ConfigError::InvalidValue(format!(
                "TICKER_MODE must be replace, history or both (got {})",
                other
            ))),
        }
    }
}

/// What happens to `signal_cache.sources` when a node upserts a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcesMode {
    /// Writer replaces the list with itself
    Overwrite,
    /// Writer is added to the existing list
    Union,
}

impl FromStr for SourcesMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(SourcesMode::Overwrite),
            "union" | "merge" => Ok(SourcesMode::Union),
            other => Err(ConfigError::InvalidValue(format!(
                "SOURCES_MODE must be overwrite or union (got {})",
                other
            ))),
        }
    }
}

/// Configuration for one node's reconciliation loop
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path to this node's SQLite database
    pub local_db: PathBuf,

    /// Location of the coordinator's SQLite database (local path or network share)
    pub coordinator_db: PathBuf,

    /// Identity written into audit rows, `sources` and `lm_machines`
    pub node_id: String,

    /// Row in `bot_status` owned by this node
    pub bot_name: String,

    pub feed_url: String,
    pub feed_exchange: String,
    pub feed_timeout: Duration,
    pub coordinator_timeout: Duration,

    /// Bound on writing one batch once the coordinator is open
    pub coordinator_push_timeout: Duration,

    /// Sleep between cycles
    pub poll_interval: Duration,

    /// Sleep after a cycle that failed outside any step
    pub failure_backoff: Duration,

    pub batch_limit: usize,
    pub signal_max_age: Duration,
    pub signal_statuses: Vec<String>,

    pub price_history_retention: Duration,
    pub sync_log_retention: Duration,

    pub ticker_mode: TickerMode,
    pub sources_mode: SourcesMode,

    /// Consecutive cycles with a local store failure before the loop gives up
    pub max_local_failures: u32,

    /// Signals listed in the end-of-cycle summary
    pub top_signals: usize,
}

impl SyncConfig {
    /// Defaults for everything except the two database locations
    pub fn new(local_db: impl Into<PathBuf>, coordinator_db: impl Into<PathBuf>) -> Self {
        Self {
            local_db: local_db.into(),
            coordinator_db: coordinator_db.into(),
            node_id: FALLBACK_NODE_ID.to_string(),
            bot_name: DEFAULT_BOT_NAME.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            feed_exchange: "MEXC".to_string(),
            feed_timeout: Duration::from_secs(10),
            coordinator_timeout: Duration::from_secs(10),
            coordinator_push_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(120),
            failure_backoff: Duration::from_secs(30),
            batch_limit: 20,
            signal_max_age: Duration::from_secs(3600),
            signal_statuses: vec!["PENDING".to_string(), "VALIDATED".to_string()],
            price_history_retention: Duration::from_secs(24 * 3600),
            sync_log_retention: Duration::from_secs(7 * 24 * 3600),
            ticker_mode: TickerMode::Replace,
            sources_mode: SourcesMode::Overwrite,
            max_local_failures: 5,
            top_signals: 5,
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SYNC_COORDINATOR_DB` (required)
    /// - `SYNC_LOCAL_DB` (default: DB/trading_v9.db)
    /// - `SYNC_NODE_ID` (default: detected local IP)
    /// - `SYNC_BOT_NAME` (default: TRADING_AI_v9)
    /// - `PRICE_FEED_URL`, `PRICE_FEED_EXCHANGE` (default: MEXC futures tickers)
    /// - `PRICE_FEED_TIMEOUT_SECS`, `COORDINATOR_TIMEOUT_SECS` (default: 10)
    /// - `COORDINATOR_PUSH_TIMEOUT_SECS` (default: 60)
    /// - `SYNC_INTERVAL_SECS` (default: 120), `SYNC_FAILURE_BACKOFF_SECS` (default: 30)
    /// - `SYNC_BATCH_LIMIT` (default: 20), `SIGNAL_MAX_AGE_SECS` (default: 3600)
    /// - `SIGNAL_STATUSES` (default: PENDING,VALIDATED)
    /// - `PRICE_HISTORY_RETENTION_HOURS` (default: 24), `SYNC_LOG_RETENTION_DAYS` (default: 7)
    /// - `TICKER_MODE` (default: replace), `SOURCES_MODE` (default: overwrite)
    /// - `MAX_LOCAL_FAILURES` (default: 5), `SYNC_TOP_SIGNALS` (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let coordinator_db = env::var("SYNC_COORDINATOR_DB")
            .map_err(|_| ConfigError::MissingVariable("SYNC_COORDINATOR_DB".to_string()))?;
        let local_db =
            env::var("SYNC_LOCAL_DB").unwrap_or_else(|_| "DB/trading_v9.db".to_string());

        let mut config = Self::new(local_db, coordinator_db);

        config.node_id = env::var("SYNC_NODE_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(detect_node_id);
        if let Ok(bot_name) = env::var("SYNC_BOT_NAME") {
            config.bot_name = bot_name;
        }
        if let Ok(url) = env::var("PRICE_FEED_URL") {
            config.feed_url = url;
        }
        if let Ok(exchange) = env::var("PRICE_FEED_EXCHANGE") {
            config.feed_exchange = exchange;
        }

        config.feed_timeout = secs_var("PRICE_FEED_TIMEOUT_SECS", config.feed_timeout)?;
        config.coordinator_timeout =
            secs_var("COORDINATOR_TIMEOUT_SECS", config.coordinator_timeout)?;
        config.coordinator_push_timeout =
            secs_var("COORDINATOR_PUSH_TIMEOUT_SECS", config.coordinator_push_timeout)?;
        config.poll_interval = secs_var("SYNC_INTERVAL_SECS", config.poll_interval)?;
        config.failure_backoff = secs_var("SYNC_FAILURE_BACKOFF_SECS", config.failure_backoff)?;
        config.signal_max_age = secs_var("SIGNAL_MAX_AGE_SECS", config.signal_max_age)?;
        config.batch_limit = parsed_var("SYNC_BATCH_LIMIT", config.batch_limit)?;

        if let Ok(statuses) = env::var("SIGNAL_STATUSES") {
            config.signal_statuses = parse_statuses(&statuses);
        }

        let history_hours: u64 = parsed_var("PRICE_HISTORY_RETENTION_HOURS", 24)?;
        config.price_history_retention = Duration::from_secs(history_hours * 3600);
        let log_days: u64 = parsed_var("SYNC_LOG_RETENTION_DAYS", 7)?;
        config.sync_log_retention = Duration::from_secs(log_days * 24 * 3600);

        if let Ok(mode) = env::var("TICKER_MODE") {
            config.ticker_mode = mode.parse()?;
        }
        if let Ok(mode) = env::var("SOURCES_MODE") {
            config.sources_mode = mode.parse()?;
        }

        config.max_local_failures = parsed_var("MAX_LOCAL_FAILURES", config.max_local_failures)?;
        config.top_signals = parsed_var("SYNC_TOP_SIGNALS", config.top_signals)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.feed_url.starts_with("http://") && !self.feed_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "PRICE_FEED_URL must start with http:// or https://".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SYNC_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if self.coordinator_push_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "COORDINATOR_PUSH_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "SYNC_BATCH_LIMIT must be greater than 0".to_string(),
            ));
        }
        if self.max_local_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_LOCAL_FAILURES must be greater than 0".to_string(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "SYNC_NODE_ID must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Outbound IP of this machine, used as the node identity
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local address
/// would route to the target.
pub fn detect_node_id() -> String {
    let detected = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified());

    match detected {
        Some(ip) => ip.to_string(),
        None => {
            log::warn!("⚠️  Could not detect local IP, using {}", FALLBACK_NODE_ID);
            FALLBACK_NODE_ID.to_string()
        }
    }
}

fn parse_statuses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} is not a valid number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parsed_var(name, default.as_secs()).map(Duration::from_secs)
}
