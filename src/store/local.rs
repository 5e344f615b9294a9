use crate::error::SyncError;
use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared handle on the node's SQLite database
///
/// Cloning is cheap; every clone talks to the same connection.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Open an existing local database
    ///
    /// Arguments:
    /// - `db_path`: Path to the SQLite file (must already exist with schema)
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path.as_ref(), flags)?;

        apply_optimized_pragmas(&conn)?;

        log::info!("✅ Local store opened: {}", db_path.as_ref().display());
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already configured connection (in-memory databases, tests)
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut guard = self.conn.lock().map_err(|_| SyncError::LocalStorePoisoned)?;
        f(&mut guard)
    }
}
