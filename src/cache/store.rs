//! Blob store tier.
//!
//! The cache addresses durable storage through `BlobStore`, one handle
//! per tenant namespace. Deployments plug in the cluster's store; the
//! bundled SQLite implementation covers single-node installs and
//! tests. Handles may report themselves closed, in which case the
//! cache re-acquires them through the factory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

/// Errors from the store tier.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store handle is closed")]
    Closed,

    #[error("failed to determine store directory")]
    NoStoreDir,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value blob storage for one tenant namespace.
pub trait BlobStore: Send + Sync {
    fn exists(&self, key: &str) -> StoreResult<bool>;

    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;

    fn delete(&self, key: &str) -> StoreResult<()>;

    fn keys(&self) -> StoreResult<Vec<String>>;

    /// Last-modified time in epoch seconds. `None` means the entry is
    /// already gone, which sweeps treat as success, not failure.
    fn last_modified(&self, key: &str) -> StoreResult<Option<i64>>;

    fn closed(&self) -> bool {
        false
    }
}

/// Opens store handles by namespace id.
pub trait StoreFactory: Send + Sync {
    fn open(&self, store_id: &str) -> StoreResult<Arc<dyn BlobStore>>;
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// =============================================================================
// SQLite store
// =============================================================================

/// SQLite-backed blob store, one database file per namespace.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &PathBuf) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                modified INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

impl BlobStore for SqliteStore {
    fn exists(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("store mutex");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM blobs WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("store mutex");
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM blobs WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT OR REPLACE INTO blobs (key, value, modified) VALUES (?, ?, ?)",
            params![key, bytes, now_secs()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute("DELETE FROM blobs WHERE key = ?", params![key])?;
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().expect("store mutex");
        let mut stmt = conn.prepare("SELECT key FROM blobs")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn last_modified(&self, key: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock().expect("store mutex");
        let modified: Option<i64> = conn
            .query_row(
                "SELECT modified FROM blobs WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(modified)
    }
}

/// Factory producing SQLite stores under a base directory.
pub struct SqliteStoreFactory {
    base_dir: PathBuf,
}

impl SqliteStoreFactory {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Default location under the user's data directory.
    pub fn default_dir() -> StoreResult<Self> {
        let base = dirs::data_dir().ok_or(StoreError::NoStoreDir)?;
        Ok(Self::new(base.join("tessera").join("stores")))
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self, store_id: &str) -> StoreResult<Arc<dyn BlobStore>> {
        let path = self.base_dir.join(format!("{}.db", store_id));
        Ok(Arc::new(SqliteStore::open(&path)?))
    }
}

// =============================================================================
// In-memory store
// =============================================================================

type MemoryEntries = Arc<Mutex<HashMap<String, (Vec<u8>, i64)>>>;

/// In-memory store with instrumentation: read counts for
/// single-cold-load verification, a closable flag for handle
/// re-acquisition tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: MemoryEntries,
    read_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the same entries as another store, as a second "process"
    /// would after a restart.
    pub fn sharing(other: &MemoryStore) -> Self {
        Self {
            entries: Arc::clone(&other.entries),
            read_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Backdate an entry's modified time (for sweep tests).
    pub fn backdate(&self, key: &str, secs: i64) {
        let mut entries = self.entries.lock().expect("memory store mutex");
        if let Some(entry) = entries.get_mut(key) {
            entry.1 -= secs;
        }
    }
}

impl BlobStore for MemoryStore {
    fn exists(&self, key: &str) -> StoreResult<bool> {
        if self.closed() {
            return Err(StoreError::Closed);
        }
        Ok(self.entries.lock().expect("memory store mutex").contains_key(key))
    }

    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        if self.closed() {
            return Err(StoreError::Closed);
        }
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .entries
            .lock()
            .expect("memory store mutex")
            .get(key)
            .map(|(bytes, _)| bytes.clone()))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        if self.closed() {
            return Err(StoreError::Closed);
        }
        self.entries
            .lock()
            .expect("memory store mutex")
            .insert(key.to_string(), (bytes.to_vec(), now_secs()));
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().expect("memory store mutex").remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .expect("memory store mutex")
            .keys()
            .cloned()
            .collect())
    }

    fn last_modified(&self, key: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .entries
            .lock()
            .expect("memory store mutex")
            .get(key)
            .map(|(_, m)| *m))
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory handing out pre-registered memory stores (tests).
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the store for a namespace, for test assertions.
    pub fn store(&self, store_id: &str) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock().expect("factory mutex");
        Arc::clone(
            stores
                .entry(store_id.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new())),
        )
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, store_id: &str) -> StoreResult<Arc<dyn BlobStore>> {
        let mut stores = self.stores.lock().expect("factory mutex");
        let store = stores
            .entry(store_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()));
        if store.closed() {
            // Fresh handle over the same entries.
            *store = Arc::new(MemoryStore::sharing(store));
        }
        Ok(Arc::clone(store) as Arc<dyn BlobStore>)
    }
}
