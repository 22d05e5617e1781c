//! # drover-kv
//!
//! The key-value store capability the scheduler persists through.
//!
//! The scheduler only assumes a handful of primitives: create-if-absent,
//! read, overwrite, delete, prefix scans and TTL leases. Anything offering
//! those (etcd, Consul, a SQLite file) can back it.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-process, for tests and single-replica dev runs.
//!   Supports fault injection.
//! - [`SqliteStore`]: durable single-file store.
//! - [`RetryingStore`]: wraps another store and retries transient failures
//!   according to a [`drover_retry::RetryPolicy`].

mod memory;
mod retrying;
mod sqlite;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use drover_retry::Retryable;
use thiserror::Error;

pub use memory::MemoryStore;
pub use retrying::RetryingStore;
pub use sqlite::SqliteStore;

/// Identifier of a TTL lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease_{}", self.0)
    }
}

/// A key with its current value, as returned by prefix scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    /// The store could not be reached or refused service.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Transient failures persisted past the configured retry budget.
    #[error("store operation gave up after {retries} retries: {last}")]
    RetriesExhausted { retries: u32, last: Box<KvError> },
}

impl KvError {
    /// Returns true for a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true when a create hit an existing key.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl Retryable for KvError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            // Only contention clears up on its own
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Key-value store with create-if-absent semantics and TTL leases.
///
/// No compare-and-swap is offered beyond [`KeyValueStore::create`] failing on
/// an existing key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Create `key`; fails with [`KvError::AlreadyExists`] if it is present.
    async fn create(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Read `key`; fails with [`KvError::NotFound`] if it is absent.
    async fn read(&self, key: &str) -> Result<String, KvError>;

    /// Write `key`, creating it if needed and replacing any previous value.
    async fn update(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Write `key` bound to a fresh lease of `ttl`, replacing any previous
    /// value. The key disappears once the lease expires unrefreshed.
    async fn create_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LeaseId, KvError>;

    /// Restart the countdown of `lease` at its full TTL.
    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Every key starting with `prefix`, ordered by key.
    async fn read_all(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KvError::Unavailable("down".into()).is_retryable());
        assert!(!KvError::NotFound("/a".into()).is_retryable());
        assert!(!KvError::AlreadyExists("/a".into()).is_retryable());
        assert!(!KvError::LeaseNotFound(LeaseId(3)).is_retryable());
    }

    #[test]
    fn test_only_sqlite_contention_is_retryable() {
        let sqlite = |code| {
            KvError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(code),
                None,
            ))
        };

        assert!(sqlite(rusqlite::ffi::SQLITE_BUSY).is_retryable());
        assert!(sqlite(rusqlite::ffi::SQLITE_LOCKED).is_retryable());
        assert!(!sqlite(rusqlite::ffi::SQLITE_CONSTRAINT).is_retryable());
        assert!(!KvError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_retryable());
    }

    #[test]
    fn test_lease_id_display() {
        assert_eq!(LeaseId(42).to_string(), "lease_42");
    }
}
