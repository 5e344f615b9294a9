//! Database provisioning
//!
//! Creates (or upgrades in place) a node or coordinator database from the embedded
//! schema. An existing file is backed up to `<path>.backup` first.
//!
//! Usage:
//!   cargo run --bin init_db -- <path> [local|coordinator]
//!
//! Kind defaults to `local`.

use dotenv::dotenv;
use log::info;
use std::env;
use std::path::PathBuf;
use tradesync::store::schema::{provision, SchemaKind};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: init_db <path> [local|coordinator]");
            std::process::exit(2);
        }
    };
    let kind: SchemaKind = match args.next() {
        Some(kind) => kind.parse()?,
        None => SchemaKind::Local,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let report = provision(&path, kind)?;

    info!("✅ Database ready: {}", path.display());
    info!("   ├─ Tables: {}", report.tables);
    info!("   ├─ Views: {}", report.views);
    match &report.backup {
        Some(backup) => info!("   ├─ Backup: {}", backup.display()),
        None => info!("   ├─ Backup: none (new file)"),
    }
    info!(
        "   └─ Schema version: {}",
        report.version.as_deref().unwrap_or("n/a")
    );

    Ok(())
}
