//! Error types for the sync scheduler.

use thiserror::Error;

use crate::account::AccountId;
use crate::monitor::SyncKind;

/// Persistence and heartbeat store errors.
///
/// A missing record is not an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Storage was unreachable or the write did not commit. Expected to clear
    /// on its own; callers log it and move on.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Stored record could not be decoded.
    #[error("corrupt record for account {account_id}: {reason}")]
    Corrupt {
        account_id: AccountId,
        reason: String,
    },

    /// Record could not be encoded for writing.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl StoreError {
    /// Create a transient error.
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Returns true for the expected, self-healing class of failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Transient(e.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for StoreError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Sync scheduler errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Account persistence or heartbeat store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A monitor could not be constructed or started.
    #[error("failed to start {kind} monitor for account {account_id}: {reason}")]
    Monitor {
        account_id: AccountId,
        kind: SyncKind,
        reason: String,
    },

    /// Work assignment service failure.
    #[error("assignment service error: {0}")]
    Assignment(String),

    /// Valkey pool error.
    #[error("valkey error: {0}")]
    Valkey(#[from] deadpool_redis::PoolError),

    /// Redis command error.
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Create a monitor error.
    #[must_use]
    pub fn monitor(account_id: AccountId, kind: SyncKind, reason: impl Into<String>) -> Self {
        Self::Monitor {
            account_id,
            kind,
            reason: reason.into(),
        }
    }

    /// Returns true if this wraps a transient storage failure.
    #[must_use]
    pub fn is_transient_storage(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// Result type for sync scheduler operations.
pub type Result<T> = std::result::Result<T, SyncError>;
