//! Event watermark persistence.
//!
//! A watermark records the last sequenced event a session processed and the
//! account it was logged in as, so a restarted client can resume the stream
//! instead of logging in again. Watermarks are keyed by endpoint and token.

use crate::error::{PuppetServiceError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub last_event_seq: u64,
    pub last_event_at: DateTime<Utc>,
    pub account_id: Option<String>,
}

impl Watermark {
    pub fn new(last_event_seq: u64, account_id: Option<String>) -> Self {
        Self {
            last_event_seq,
            last_event_at: Utc::now(),
            account_id,
        }
    }

    /// Whether the last event is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.last_event_at) > max_age,
            Err(_) => false,
        }
    }
}

/// Derive the storage key for a service endpoint and credential.
///
/// The token is hashed so it never lands on disk.
pub fn watermark_key(endpoint: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Storage for watermarks.
///
/// Reads and writes are independent calls; a get followed by a set is not
/// atomic.
pub trait WatermarkStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Result<Option<Watermark>>;

    fn set(&self, key: &str, watermark: &Watermark) -> Result<()>;

    /// Returns whether a watermark was removed.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// Process-local store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    entries: Mutex<HashMap<String, Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Watermark>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get(&self, key: &str) -> Result<Option<Watermark>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, watermark: &Watermark) -> Result<()> {
        self.entries().insert(key.to_string(), watermark.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries().remove(key).is_some())
    }
}

/// SQLite-backed store that survives client restarts.
///
/// Thread-safe via internal mutex on the connection.
#[derive(Debug)]
pub struct SqliteWatermarkStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWatermarkStore {
    /// Open (or create) the store at `db_path`.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PuppetServiceError::Io {
                message: format!("Failed to create watermark directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| PuppetServiceError::Database {
            message: format!("Failed to open watermark database: {}", e),
            source: Some(e),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| PuppetServiceError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::with_connection(conn)
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| PuppetServiceError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS watermarks (
                    key TEXT PRIMARY KEY,
                    last_event_seq INTEGER NOT NULL,
                    last_event_at TEXT NOT NULL,
                    account_id TEXT
                );
                "#,
            )
            .map_err(|e| PuppetServiceError::Database {
                message: format!("Failed to initialize watermark schema: {}", e),
                source: Some(e),
            })
    }
}

impl WatermarkStore for SqliteWatermarkStore {
    fn get(&self, key: &str) -> Result<Option<Watermark>> {
        let conn = self.conn()?;
        let row: Option<(i64, String, Option<String>)> = conn
            .query_row(
                "SELECT last_event_seq, last_event_at, account_id FROM watermarks WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((seq, at, account_id)) = row else {
            return Ok(None);
        };

        let last_event_at = DateTime::parse_from_rfc3339(&at)
            .map_err(|e| PuppetServiceError::Database {
                message: format!("Corrupt watermark timestamp {:?}: {}", at, e),
                source: None,
            })?
            .with_timezone(&Utc);

        Ok(Some(Watermark {
            last_event_seq: u64::try_from(seq).unwrap_or(0),
            last_event_at,
            account_id,
        }))
    }

    fn set(&self, key: &str, watermark: &Watermark) -> Result<()> {
        let seq = i64::try_from(watermark.last_event_seq).map_err(|_| {
            PuppetServiceError::Validation {
                field: "last_event_seq".to_string(),
                message: format!("{} does not fit in storage", watermark.last_event_seq),
            }
        })?;

        self.conn()?.execute(
            r#"
            INSERT INTO watermarks (key, last_event_seq, last_event_at, account_id)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                last_event_seq = ?2,
                last_event_at = ?3,
                account_id = ?4
            "#,
            params![
                key,
                seq,
                watermark.last_event_at.to_rfc3339(),
                watermark.account_id
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM watermarks WHERE key = ?1", params![key])?;
        if removed > 0 {
            debug!("Deleted watermark {}", key);
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn WatermarkStore) {
        assert_eq!(store.get("k").unwrap(), None);

        let mark = Watermark::new(42, Some("wxid_a1".into()));
        store.set("k", &mark).unwrap();
        let back = store.get("k").unwrap().unwrap();
        assert_eq!(back.last_event_seq, 42);
        assert_eq!(back.account_id.as_deref(), Some("wxid_a1"));

        store.set("k", &Watermark::new(43, None)).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().last_event_seq, 43);

        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryWatermarkStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteWatermarkStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("watermark.sqlite");

        {
            let store = SqliteWatermarkStore::new(&path).unwrap();
            store.set("k", &Watermark::new(7, Some("a".into()))).unwrap();
        }

        let store = SqliteWatermarkStore::new(&path).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().last_event_seq, 7);
    }

    #[test]
    fn test_staleness() {
        let mark = Watermark::new(1, None);
        let max_age = Duration::from_secs(15 * 60);

        assert!(!mark.is_stale(Utc::now(), max_age));
        let later = mark.last_event_at + chrono::Duration::minutes(16);
        assert!(mark.is_stale(later, max_age));
    }

    #[test]
    fn test_key_depends_on_endpoint_and_token() {
        let a = watermark_key("host:1", "insecure_a");
        assert_eq!(a, watermark_key("host:1", "insecure_a"));
        assert_ne!(a, watermark_key("host:2", "insecure_a"));
        assert_ne!(a, watermark_key("host:1", "insecure_b"));
        assert!(!a.contains("insecure"));
    }
}
