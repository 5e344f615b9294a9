//! Local persistent store
//!
//! The node's SQLite file is owned by the cycle loop. Other processes may read it;
//! only the loop writes. The store is opened without `CREATE`: provisioning is the
//! job of the `init_db` binary, and a missing file is reported at startup instead of
//! silently producing an empty database.

pub mod local;
pub mod schema;

pub use local::LocalStore;
