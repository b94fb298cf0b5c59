//! State backend error types.

use trawler_types::run::RunId;

/// Errors produced by [`StateBackend`](crate::backend::StateBackend)
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON column could not be encoded or decoded.
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,

    /// A terminal status was already recorded; run records are immutable
    /// once terminal.
    #[error("run {0} is already finalized")]
    RunFinalized(RunId),

    /// Referenced run does not exist.
    #[error("run {0} not found")]
    RunMissing(RunId),

    /// Optimistic version guard on a source-health write failed.
    #[error("source health version conflict for {source_key}: expected {expected}")]
    VersionConflict { source_key: String, expected: i64 },

    /// Serialized checkpoint payload exceeds the allowed bound.
    #[error("checkpoint payload is {size} bytes, limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A stored column held a value the model cannot decode.
    #[error("invalid {field} value in state row: {value}")]
    Decode { field: &'static str, value: String },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
