//! Sync Node - one node's reconciliation loop
//!
//! Every cycle:
//! - Pulls tickers from the price feed into the local store
//! - Pushes the freshest, best-scored signals to the coordinator
//! - Refreshes this node's heartbeat and prunes old telemetry
//!
//! Usage:
//!   cargo run --release --bin sync_node
//!
//! Environment variables: see `SyncConfig::from_env`. At minimum:
//!   SYNC_COORDINATOR_DB - Coordinator database (local path or mounted share)
//!   SYNC_LOCAL_DB - This node's database (default: DB/trading_v9.db)

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;
use tradesync::reconcile::{HttpPriceFeed, SyncScheduler};
use tradesync::store::LocalStore;
use tradesync::SyncConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env()?;

    info!("🔧 Configuration loaded");
    info!("   ├─ Local DB: {}", config.local_db.display());
    info!("   ├─ Batch limit: {}", config.batch_limit);
    info!("   ├─ Signal max age: {}s", config.signal_max_age.as_secs());
    info!("   ├─ Ticker mode: {:?}", config.ticker_mode);
    info!("   └─ Sources mode: {:?}", config.sources_mode);

    let store = LocalStore::open(&config.local_db)?;
    let feed = Arc::new(HttpPriceFeed::new(
        config.feed_url.clone(),
        config.feed_exchange.clone(),
        config.feed_timeout,
    )?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("");
                info!("⚠️  Received CTRL+C, stopping after the current step...");
                let _ = stop_tx.send(true);
            }
            Err(err) => {
                error!("❌ Failed to listen for CTRL+C: {}", err);
            }
        }
    });

    let mut scheduler = SyncScheduler::new(config, store, feed, stop_rx);
    info!("🔄 Press CTRL+C to shutdown gracefully");

    if let Err(e) = scheduler.run().await {
        error!("❌ Sync node stopped: {}", e);
        return Err(e.into());
    }

    Ok(())
}
