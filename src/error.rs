//! Typed failures for the reconciliation cycle
//!
//! Every step returns `Result<_, SyncError>`. The scheduler never inspects the
//! message, only the [`ErrorClass`], to decide how loudly to log and whether a
//! failure counts towards local-store escalation.

use std::time::Duration;

/// How a failure is treated by the cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Feed or coordinator unreachable, timeouts. Warn and move on.
    Transient,
    /// Malformed payload or record. Skip the offending item.
    DataShape,
    /// Local store locked, unwritable or poisoned. Error, escalate if sustained.
    LocalResource,
    /// Anything that does not fit the other classes.
    Unexpected,
}

#[derive(Debug)]
pub enum SyncError {
    /// Feed request failed before a response arrived
    FeedUnavailable(String),
    /// Feed answered with a non-2xx status
    FeedStatus(u16),
    /// Whole feed body could not be understood
    MalformedPayload(String),
    /// A single record in a batch could not be coerced
    MalformedRecord { key: String, reason: String },
    /// Network-bound operation exceeded its bound
    Timeout { operation: &'static str, after: Duration },
    /// Coordinator store could not be opened
    CoordinatorUnreachable(String),
    /// Coordinator store faulted after it was opened
    Coordinator(rusqlite::Error),
    /// Local store query or write failed
    LocalStore(rusqlite::Error),
    /// Local store mutex was poisoned by a panicking holder
    LocalStorePoisoned,
    Unexpected(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::FeedUnavailable(_)
            | SyncError::FeedStatus(_)
            | SyncError::Timeout { .. }
            | SyncError::CoordinatorUnreachable(_)
            | SyncError::Coordinator(_) => ErrorClass::Transient,
            SyncError::MalformedPayload(_) | SyncError::MalformedRecord { .. } => {
                ErrorClass::DataShape
            }
            SyncError::LocalStore(_) | SyncError::LocalStorePoisoned => ErrorClass::LocalResource,
            SyncError::Unexpected(_) => ErrorClass::Unexpected,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_local(&self) -> bool {
        self.class() == ErrorClass::LocalResource
    }

    pub(crate) fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::MalformedRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that concern one row, as opposed to the store itself
///
/// Busy, locked, missing-table and I/O failures are store-level.
pub(crate) fn is_row_level(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.code == rusqlite::ErrorCode::ConstraintViolation,
        rusqlite::Error::ToSqlConversionFailure(_) => true,
        _ => false,
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::LocalStore(err)
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::FeedUnavailable(msg) => write!(f, "Price feed unavailable: {}", msg),
            SyncError::FeedStatus(code) => write!(f, "Price feed returned HTTP {}", code),
            SyncError::MalformedPayload(msg) => write!(f, "Malformed feed payload: {}", msg),
            SyncError::MalformedRecord { key, reason } => {
                write!(f, "Malformed record {}: {}", key, reason)
            }
            SyncError::Timeout { operation, after } => {
                write!(f, "{} timed out after {}s", operation, after.as_secs())
            }
            SyncError::CoordinatorUnreachable(msg) => {
                write!(f, "Coordinator unreachable: {}", msg)
            }
            SyncError::Coordinator(e) => write!(f, "Coordinator store error: {}", e),
            SyncError::LocalStore(e) => write!(f, "Local store error: {}", e),
            SyncError::LocalStorePoisoned => write!(f, "Local store lock poisoned"),
            SyncError::Unexpected(msg) => write!(f, "Unexpected failure: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Coordinator(e) | SyncError::LocalStore(e) => Some(e),
            _ => None,
        }
    }
}
