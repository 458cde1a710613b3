//! SQLite-backed document store.
//!
//! Uses a single `documents` table keyed by `(tenant_id, extension_id, key)`.
//! Writes are single-statement upserts, so each write is atomic and the last
//! writer wins.

use crate::document::{DocumentStore, Namespace};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Persistent document store backed by SQLite.
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDocumentStore {
    /// Opens (or creates) a document store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Backend(format!("failed to open document store {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Opened SQLite document store");
        Self::with_connection(conn)
    }

    /// Opens an in-memory document store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Backend(format!("failed to open in-memory document store: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                tenant_id TEXT NOT NULL,
                extension_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, extension_id, key)
            );
            ",
        )
        .map_err(|e| StoreError::Backend(format!("failed to init document schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("document store lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("document store task failed: {e}")))?
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, ns: &Namespace, key: &str) -> StoreResult<Option<Value>> {
        let ns = ns.clone();
        let key = key.to_string();
        let raw: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM documents WHERE tenant_id = ?1 AND extension_id = ?2 AND key = ?3",
                        params![ns.tenant_id.as_str(), ns.extension_id.as_str(), key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn put(&self, ns: &Namespace, key: &str, value: Value) -> StoreResult<()> {
        let ns = ns.clone();
        let key = key.to_string();
        let encoded = serde_json::to_string(&value)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (tenant_id, extension_id, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tenant_id, extension_id, key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![
                    ns.tenant_id.as_str(),
                    ns.extension_id.as_str(),
                    key,
                    encoded,
                    now_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, ns: &Namespace, key: &str) -> StoreResult<bool> {
        let ns = ns.clone();
        let key = key.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM documents WHERE tenant_id = ?1 AND extension_id = ?2 AND key = ?3",
                params![ns.tenant_id.as_str(), ns.extension_id.as_str(), key],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn clear(&self, ns: &Namespace) -> StoreResult<u64> {
        let ns = ns.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM documents WHERE tenant_id = ?1 AND extension_id = ?2",
                params![ns.tenant_id.as_str(), ns.extension_id.as_str()],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn count(&self, ns: &Namespace) -> StoreResult<u64> {
        let ns = ns.clone();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE tenant_id = ?1 AND extension_id = ?2",
                params![ns.tenant_id.as_str(), ns.extension_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }
}
