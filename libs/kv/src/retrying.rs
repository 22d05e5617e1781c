//! Store wrapper that retries transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drover_retry::{run_policy, RetryError, RetryPolicy};

use crate::{KeyValue, KeyValueStore, KvError, LeaseId};

/// Retries every call to the wrapped store under a copy of `policy`.
///
/// Each operation starts from a fresh copy, so one long outage does not eat
/// into the budget of later calls. Only [`KvError::Unavailable`] and SQLite
/// busy or locked failures are retried; semantic errors such as `NotFound`
/// are returned immediately.
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The template policy each operation starts from.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

fn flatten(err: RetryError<KvError>) -> KvError {
    match err {
        RetryError::Exhausted { retries, last } => KvError::RetriesExhausted {
            retries,
            last: Box::new(last),
        },
        RetryError::Permanent(e) => e,
    }
}

#[async_trait]
impl KeyValueStore for RetryingStore {
    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.create(key, value))
            .await
            .map_err(flatten)
    }

    async fn read(&self, key: &str) -> Result<String, KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.read(key))
            .await
            .map_err(flatten)
    }

    async fn update(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.update(key, value))
            .await
            .map_err(flatten)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.delete(key))
            .await
            .map_err(flatten)
    }

    async fn create_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LeaseId, KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.create_with_lease(key, value, ttl))
            .await
            .map_err(flatten)
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.refresh_lease(lease))
            .await
            .map_err(flatten)
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        let mut policy = self.policy.clone();
        run_policy(&mut policy, || self.inner.read_all(prefix))
            .await
            .map_err(flatten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), false)
            .with_bounds(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let memory = Arc::new(MemoryStore::new());
        memory.set_available(false);
        let store = RetryingStore::new(memory.clone(), fast_policy(2));

        match store.update("/a", "1").await {
            Err(KvError::RetriesExhausted { retries, last }) => {
                assert_eq!(retries, 2);
                assert!(matches!(*last, KvError::Unavailable(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_semantic_errors_pass_through() {
        let store = RetryingStore::new(Arc::new(MemoryStore::new()), fast_policy(3));
        assert!(store.read("/missing").await.unwrap_err().is_not_found());

        store.create("/a", "1").await.unwrap();
        assert!(store.create("/a", "2").await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_recovers_when_store_returns() {
        let memory = Arc::new(MemoryStore::new());
        memory.set_available(false);
        let store = RetryingStore::new(
            memory.clone(),
            RetryPolicy::new(50, Duration::from_millis(5), false)
                .with_bounds(Duration::from_millis(5), Duration::from_millis(5)),
        );

        let flip = {
            let memory = memory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                memory.set_available(true);
            })
        };

        store.update("/a", "1").await.unwrap();
        flip.await.unwrap();
        assert_eq!(memory.read("/a").await.unwrap(), "1");
    }
}
