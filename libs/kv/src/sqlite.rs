//! SQLite-backed store.
//!
//! One `kv` table holds the keys; a `leases` table holds TTL leases. Keys bound
//! to an expired lease are purged at the start of every operation, so readers
//! never see them.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{KeyValue, KeyValueStore, KvError, LeaseId};

/// Durable single-file store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;

        // WAL keeps readers off the writer's lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, KvError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool, after purging
    /// expired leases.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, i64) -> Result<T, KvError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| KvError::Unavailable("SQLite connection lock poisoned".into()))?;
            let now = now_ms();
            purge_expired(&conn, now)?;
            f(&conn, now)
        })
        .await
        .map_err(|e| KvError::Unavailable(format!("SQLite worker failed: {e}")))?
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn init_schema(conn: &Connection) -> Result<(), KvError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ttl_ms INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            lease_id INTEGER REFERENCES leases(id)
        );

        CREATE INDEX IF NOT EXISTS idx_kv_lease ON kv(lease_id);
        "#,
    )?;

    debug!("KV store schema initialized");
    Ok(())
}

fn purge_expired(conn: &Connection, now: i64) -> Result<(), KvError> {
    let purged = conn.execute(
        "DELETE FROM kv WHERE lease_id IN (SELECT id FROM leases WHERE expires_at <= ?1)",
        params![now],
    )?;
    conn.execute("DELETE FROM leases WHERE expires_at <= ?1", params![now])?;

    if purged > 0 {
        debug!(purged, "Purged keys with expired leases");
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn, _| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO kv (key, value, lease_id) VALUES (?1, ?2, NULL)",
                params![key, value],
            )?;
            if inserted == 0 {
                return Err(KvError::AlreadyExists(key));
            }
            Ok(())
        })
        .await
    }

    async fn read(&self, key: &str) -> Result<String, KvError> {
        let key = key.to_string();
        self.with_conn(move |conn, _| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .ok_or(KvError::NotFound(key))
        })
        .await
    }

    async fn update(&self, key: &str, value: &str) -> Result<(), KvError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn, _| {
            conn.execute(
                r#"
                INSERT INTO kv (key, value, lease_id) VALUES (?1, ?2, NULL)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, lease_id = NULL
                "#,
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let key = key.to_string();
        self.with_conn(move |conn, _| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn create_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LeaseId, KvError> {
        let (key, value) = (key.to_string(), value.to_string());
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.with_conn(move |conn, now| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO leases (ttl_ms, expires_at) VALUES (?1, ?2)",
                params![ttl_ms, now.saturating_add(ttl_ms)],
            )?;
            let lease = LeaseId(tx.last_insert_rowid());
            tx.execute(
                r#"
                INSERT INTO kv (key, value, lease_id) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, lease_id = excluded.lease_id
                "#,
                params![key, value, lease.0],
            )?;
            tx.commit()?;
            Ok(lease)
        })
        .await
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), KvError> {
        self.with_conn(move |conn, now| {
            let updated = conn.execute(
                "UPDATE leases SET expires_at = ?1 + ttl_ms WHERE id = ?2",
                params![now, lease.0],
            )?;
            if updated == 0 {
                return Err(KvError::LeaseNotFound(lease));
            }
            Ok(())
        })
        .await
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn, _| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let entries = stmt
                .query_map(params![prefix], |row| {
                    Ok(KeyValue {
                        key: row.get(0)?,
                        value: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_read_update() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.create("/leader", "10.0.0.1:7070").await.unwrap();
        assert!(store
            .create("/leader", "10.0.0.2:7070")
            .await
            .unwrap_err()
            .is_already_exists());

        store.update("/leader", "10.0.0.3:7070").await.unwrap();
        assert_eq!(store.read("/leader").await.unwrap(), "10.0.0.3:7070");

        store.delete("/leader").await.unwrap();
        store.delete("/leader").await.unwrap();
        assert!(store.read("/leader").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_prefix_scan_is_literal() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.update("/taskgroup/web_1/t-1", "a").await.unwrap();
        store.update("/taskgroup/webx1/t-1", "b").await.unwrap();

        // '_' must not act as a wildcard
        let found = store.read_all("/taskgroup/web_1/").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "a");
    }

    #[tokio::test]
    async fn test_expired_lease_hides_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let lease = store
            .create_with_lease("/frameworkId", "fw-1", Duration::from_millis(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.read("/frameworkId").await.unwrap_err().is_not_found());
        assert!(matches!(
            store.refresh_lease(lease).await,
            Err(KvError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_key_alive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let lease = store
            .create_with_lease("/frameworkId", "fw-1", Duration::from_secs(60))
            .await
            .unwrap();

        store.refresh_lease(lease).await.unwrap();
        assert_eq!(store.read("/frameworkId").await.unwrap(), "fw-1");
    }
}
