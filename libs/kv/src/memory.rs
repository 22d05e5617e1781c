//! In-process store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{KeyValue, KeyValueStore, KvError, LeaseId};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
}

impl Inner {
    /// Drop expired leases and every key bound to them.
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return;
        }

        for id in &expired {
            self.leases.remove(id);
        }
        self.entries
            .retain(|_, entry| !entry.lease.is_some_and(|l| expired.contains(&l)));
    }
}

/// Store kept entirely in memory.
///
/// Lease expiry follows the tokio clock, so paused-time tests can advance it.
/// [`MemoryStore::set_available`] switches every operation to
/// [`KvError::Unavailable`] to simulate an outage.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_lease: AtomicI64,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_lease: AtomicI64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        inner.entries.len()
    }

    /// Returns true if no live keys remain.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("memory store marked unavailable".into()))
        }
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Inner>, KvError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        Ok(inner)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.lock().await?;
        if inner.entries.contains_key(key) {
            return Err(KvError::AlreadyExists(key.to_string()));
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<String, KvError> {
        let inner = self.lock().await?;
        inner
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn update(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.lock().await?;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.lock().await?;
        inner.entries.remove(key);
        Ok(())
    }

    async fn create_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LeaseId, KvError> {
        let mut inner = self.lock().await?;
        let id = LeaseId(self.next_lease.fetch_add(1, Ordering::SeqCst));
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: Some(id),
            },
        );
        Ok(id)
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut inner = self.lock().await?;
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(KvError::LeaseNotFound(lease))?;
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        let inner = self.lock().await?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_existing_key() {
        let store = MemoryStore::new();
        store.create("/leader", "10.0.0.1:7070").await.unwrap();

        let err = store.create("/leader", "10.0.0.2:7070").await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.read("/leader").await.unwrap(), "10.0.0.1:7070");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete("/missing").await.unwrap();
        store.update("/a", "1").await.unwrap();
        store.delete("/a").await.unwrap();
        assert!(store.read("/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_all_filters_by_prefix() {
        let store = MemoryStore::new();
        store.update("/tasks/a", "1").await.unwrap();
        store.update("/tasks/b", "2").await.unwrap();
        store.update("/taskgroup/web", "").await.unwrap();

        let tasks = store.read_all("/tasks/").await.unwrap();
        let keys: Vec<_> = tasks.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/tasks/a", "/tasks/b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_unless_refreshed() {
        let store = MemoryStore::new();
        let lease = store
            .create_with_lease("/frameworkId", "fw-1", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.refresh_lease(lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.read("/frameworkId").await.unwrap(), "fw-1");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.read("/frameworkId").await.unwrap_err().is_not_found());
        assert!(matches!(
            store.refresh_lease(lease).await,
            Err(KvError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.update("/a", "1").await,
            Err(KvError::Unavailable(_))
        ));

        store.set_available(true);
        store.update("/a", "1").await.unwrap();
    }
}
