pub mod clock;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod sqlite_pragma;
pub mod store;

pub use config::SyncConfig;
pub use error::{ErrorClass, SyncError};
