//! Canonical schemas, embedded from `sql/`
//!
//! All files use `IF NOT EXISTS` so applying them twice is a no-op. The sync engine
//! itself never calls these; they back the `init_db` binary and the tests.

use rusqlite::{Connection, OptionalExtension};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const LOCAL_SCHEMA: &[(&str, &str)] = &[
    ("00_schema_info.sql", include_str!("../../sql/local/00_schema_info.sql")),
    ("01_trading_signals.sql", include_str!("../../sql/local/01_trading_signals.sql")),
    ("02_tickers.sql", include_str!("../../sql/local/02_tickers.sql")),
    ("03_liveness.sql", include_str!("../../sql/local/03_liveness.sql")),
    ("04_sync_log.sql", include_str!("../../sql/local/04_sync_log.sql")),
];

pub const COORDINATOR_SCHEMA: &[(&str, &str)] = &[
    ("01_signal_cache.sql", include_str!("../../sql/coordinator/01_signal_cache.sql")),
    ("02_sync_log.sql", include_str!("../../sql/coordinator/02_sync_log.sql")),
];

/// Execute schema files in order inside one transaction
pub fn apply_schema(conn: &mut Connection, files: &[(&str, &str)]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for (name, sql) in files {
        log::info!("   ├─ Executing: {}", name);
        tx.execute_batch(sql)?;
    }
    tx.commit()?;
    log::info!("   └─ ✅ {} schema files applied", files.len());
    Ok(())
}

pub fn apply_local_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    apply_schema(conn, LOCAL_SCHEMA)
}

pub fn apply_coordinator_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    apply_schema(conn, COORDINATOR_SCHEMA)
}

/// Number of tables and views, for the provisioning summary
pub fn object_counts(conn: &Connection) -> rusqlite::Result<(i64, i64)> {
    let tables = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    let views = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view'",
        [],
        |row| row.get(0),
    )?;
    Ok((tables, views))
}

/// Latest version recorded in `schema_info`, if the table exists
pub fn schema_version(conn: &Connection) -> rusqlite::Result<Option<String>> {
    let has_table: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'",
        [],
        |row| row.get(0),
    )?;
    if has_table == 0 {
        return Ok(None);
    }
    conn.query_row(
        "SELECT version FROM schema_info ORDER BY applied_at DESC, rowid DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
}

/// Which database a file is being provisioned as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Local,
    Coordinator,
}

impl SchemaKind {
    pub fn files(self) -> &'static [(&'static str, &'static str)] {
        match self {
            SchemaKind::Local => LOCAL_SCHEMA,
            SchemaKind::Coordinator => COORDINATOR_SCHEMA,
        }
    }
}

impl FromStr for SchemaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "node" => Ok(SchemaKind::Local),
            "coordinator" | "master" => Ok(SchemaKind::Coordinator),
            other => Err(format!("unknown schema kind {} (expected local or coordinator)", other)),
        }
    }
}

#[derive(Debug)]
pub struct ProvisionReport {
    /// Copy of the file as it was before provisioning
    pub backup: Option<PathBuf>,
    pub tables: i64,
    pub views: i64,
    pub version: Option<String>,
}

/// `<path>.backup`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".backup");
    PathBuf::from(name)
}

/// Create or upgrade a database file with the embedded schema
///
/// An existing file is copied to `<path>.backup` first (overwriting an older backup).
pub fn provision(path: &Path, kind: SchemaKind) -> Result<ProvisionReport, Box<dyn std::error::Error>> {
    let backup = if path.exists() {
        let target = backup_path(path);
        fs::copy(path, &target)?;
        log::info!("💾 Backup created: {}", target.display());
        Some(target)
    } else {
        None
    };

    log::info!("🔧 Applying {:?} schema to {}", kind, path.display());
    let mut conn = Connection::open(path)?;
    apply_schema(&mut conn, kind.files())?;

    let (tables, views) = object_counts(&conn)?;
    let version = schema_version(&conn)?;
    Ok(ProvisionReport {
        backup,
        tables,
        views,
        version,
    })
}
