use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::feed::CacheHints;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening the state database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the daemon has locked the database
    #[error("Another instance of skimd appears to be running. Please stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Errors raised by [`StateStore`](super::StateStore) operations once running.
///
/// Contained to the source being reconciled: the engine reschedules that
/// source as failed and carries on with the rest.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("State store query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("Source is not registered: {0}")]
    UnknownSource(String),

    /// The store cannot serve requests at all (closed or exhausted pool)
    #[error("State store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StateStoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => Self::Unavailable(e.to_string()),
            other => Self::Query(other),
        }
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Row type for source queries
pub(crate) type SourceRow = (
    String,         // id
    String,         // url
    bool,           // enabled
    Option<i64>,    // next_poll_at (ms)
    i64,            // consecutive_failures
    Option<i64>,    // last_success_at (ms)
    Option<String>, // etag
    Option<String>, // last_modified
);

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

// ============================================================================
// Data Structures
// ============================================================================

/// Persisted scheduling state of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// `None` until the source has been polled once
    pub next_poll_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// A source as recorded in the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSource {
    pub id: String,
    pub url: String,
    pub enabled: bool,
    pub schedule: ScheduleState,
    pub cache_hints: CacheHints,
}

impl From<SourceRow> for StoredSource {
    fn from(row: SourceRow) -> Self {
        let (id, url, enabled, next_poll_at, failures, last_success_at, etag, last_modified) = row;
        StoredSource {
            id,
            url,
            enabled,
            schedule: ScheduleState {
                next_poll_at: next_poll_at.and_then(from_millis),
                consecutive_failures: u32::try_from(failures).unwrap_or(0),
                last_success_at: last_success_at.and_then(from_millis),
            },
            cache_hints: CacheHints {
                etag,
                last_modified,
            },
        }
    }
}
