//! # Key-Value Store
//!
//! Small persisted key-value state shared by the courier context and the
//! credential store: last known position, shift status, current order,
//! tokens.
//!
//! Values are JSON documents. The in-memory store is the default; the
//! SQLite store (feature `persistence`) encodes values as MessagePack blobs.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{NavError, Result};

/// Storage keys used by the courier app.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "worker_app_access_token";
    pub const REFRESH_TOKEN: &str = "worker_app_refresh_token";
    pub const LAST_LOCATION: &str = "worker_app_last_location";
    pub const SHIFT_STATUS: &str = "worker_app_shift_status";
    pub const CURRENT_ORDER: &str = "worker_app_current_order";
    pub const IN_TRANSIT: &str = "worker_app_in_transit";
}

/// Persisted key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Typed helpers over any [`KeyValueStore`].
pub trait StoreExt {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>;
    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> StoreExt for S {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?)
    }
}

fn lock_poisoned() -> NavError {
    NavError::Persistence {
        message: "store lock poisoned".to_string(),
    }
}

/// Process-lifetime store, used in tests and when nothing needs to survive
/// an app restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

#[cfg(feature = "persistence")]
pub use sqlite::SqliteStore;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::sync::Mutex;

    use log::info;
    use rusqlite::{params, Connection, OptionalExtension};
    use serde_json::Value;

    use super::{lock_poisoned, KeyValueStore};
    use crate::{NavError, Result};

    fn db_error(e: rusqlite::Error) -> NavError {
        NavError::Persistence {
            message: e.to_string(),
        }
    }

    /// SQLite-backed store. Values are MessagePack-encoded JSON documents.
    pub struct SqliteStore {
        db: Mutex<Connection>,
    }

    impl SqliteStore {
        /// Open (or create) the database at `db_path`.
        pub fn new(db_path: &str) -> Result<Self> {
            let db = Connection::open(db_path).map_err(db_error)?;
            Self::init_schema(&db)?;
            info!("[SqliteStore] Opened {}", db_path);
            Ok(Self { db: Mutex::new(db) })
        }

        /// In-memory database, mostly for tests.
        pub fn in_memory() -> Result<Self> {
            let db = Connection::open_in_memory().map_err(db_error)?;
            Self::init_schema(&db)?;
            Ok(Self { db: Mutex::new(db) })
        }

        fn init_schema(db: &Connection) -> Result<()> {
            db.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(db_error)
        }
    }

    impl KeyValueStore for SqliteStore {
        fn get(&self, key: &str) -> Result<Option<Value>> {
            let db = self.db.lock().map_err(|_| lock_poisoned())?;
            let blob: Option<Vec<u8>> = db
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error)?;

            match blob {
                Some(bytes) => rmp_serde::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| NavError::Serialization {
                        message: e.to_string(),
                    }),
                None => Ok(None),
            }
        }

        fn set(&self, key: &str, value: Value) -> Result<()> {
            let blob = rmp_serde::to_vec(&value).map_err(|e| NavError::Serialization {
                message: e.to_string(),
            })?;
            let db = self.db.lock().map_err(|_| lock_poisoned())?;
            db.execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
                params![key, blob, chrono::Utc::now().timestamp()],
            )
            .map_err(db_error)?;
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<()> {
            let db = self.db.lock().map_err(|_| lock_poisoned())?;
            db.execute("DELETE FROM kv_store WHERE key = ?", params![key])
                .map_err(db_error)?;
            Ok(())
        }
    }
}
