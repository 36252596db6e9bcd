//! Keyed persistence for forms, roles, responses, confirmations and sealing keys.
//!
//! Every value is one whole CBOR document under one key; there is no
//! partial update. A value that no longer decodes is logged and treated
//! as absent rather than failing the caller.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::OptionalExtension;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CBOR encode error: {0}")]
    Encode(String),
    #[error("storage lock poisoned")]
    Poisoned,
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// All keys starting with `prefix`, in lexicographic order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

// ============================================================================
// Typed helpers
// ============================================================================

pub fn put_cbor<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<(), StorageError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StorageError::Encode(e.to_string()))?;
    kv.set(key, &buf)
}

pub fn get_cbor<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>, StorageError> {
    let Some(bytes) = kv.get(key)? else {
        return Ok(None);
    };
    match ciborium::from_reader(bytes.as_slice()) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("Ignoring corrupted value at {key}: {e}");
            Ok(None)
        }
    }
}

/// Decode every value under `prefix`, skipping corrupted ones.
pub fn scan_cbor<T: DeserializeOwned>(
    kv:     &dyn KvStore,
    prefix: &str,
) -> Result<Vec<(String, T)>, StorageError> {
    let mut out = Vec::new();
    for key in kv.keys_with_prefix(prefix)? {
        if let Some(value) = get_cbor(kv, &key)? {
            out.push((key, value));
        }
    }
    Ok(out)
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut guard = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        guard.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        guard.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let guard = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

PRAGMA journal_mode = WAL;
PRAGMA synchronous  = NORMAL;
";

pub struct SqliteKv {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Opened store at {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", rusqlite::params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(rusqlite::params![prefix], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}
