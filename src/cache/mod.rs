//! Layered result cache.
//!
//! Realized tables are shared across requests through two tiers: a
//! process-local concurrent map (fast path, no locks on read) and a
//! per-tenant blob store. Cold loads from the store are collapsed
//! through key-striped locks so N concurrent requesters deserialize
//! once; across processes there is deliberately no coordination.
//! Duplicate computation is cheaper than a distributed lock, and the
//! cache is an optimization, never a correctness dependency.
//!
//! # Key layout
//!
//! ```text
//! store namespace:  {org-lowercased}__tableCacheStore
//! store key:        {cluster-incarnation}:{fingerprint}
//! ```
//!
//! The incarnation prefix is what the cleanup sweep uses to identify
//! entries belonging to a dead cluster generation.

mod key;
mod store;
mod sweep;

pub use key::{compact, DataKey};
pub use store::{
    BlobStore, MemoryStore, MemoryStoreFactory, SqliteStore, SqliteStoreFactory, StoreError,
    StoreFactory, StoreResult,
};
pub use sweep::{sweep_store, SweepStats};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::lens::TableData;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Compute SHA256 hash of a serializable value.
///
/// The value is serialized to JSON before hashing, ensuring
/// deterministic output. Returns a 64-character lowercase hex string.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Cluster identity and singleton-scheduling facade.
pub trait ClusterService: Send + Sync {
    /// Stable incarnation id of the running cluster generation.
    fn incarnation(&self) -> String;

    /// Whether this node currently owns singleton jobs (the sweep).
    fn is_sweep_owner(&self) -> bool;
}

/// Single-node cluster: always the sweep owner.
pub struct StaticCluster {
    incarnation: String,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self {
            incarnation: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_incarnation(incarnation: &str) -> Self {
        Self {
            incarnation: incarnation.to_string(),
        }
    }
}

impl Default for StaticCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterService for StaticCluster {
    fn incarnation(&self) -> String {
        self.incarnation.clone()
    }

    fn is_sweep_owner(&self) -> bool {
        true
    }
}

/// Cache statistics for one tenant namespace.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub local_entries: usize,
    pub store_entries: usize,
}

/// The layered table cache.
pub struct TableCache {
    local: DashMap<String, Arc<TableData>>,
    stores: Mutex<HashMap<String, Arc<dyn BlobStore>>>,
    factory: Arc<dyn StoreFactory>,
    cluster: Arc<dyn ClusterService>,
    /// Bounded set of lock stripes capping lock-object memory.
    locks: Vec<Mutex<()>>,
    retention: Duration,
    sweep_interval: Duration,
    runtime: tokio::runtime::Runtime,
    pending: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TableCache {
    pub fn new(
        settings: &CacheSettings,
        factory: Arc<dyn StoreFactory>,
        cluster: Arc<dyn ClusterService>,
    ) -> CacheResult<Self> {
        let stripes = settings.lock_stripes.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tessera-cache")
            .enable_time()
            .build()?;
        Ok(Self {
            local: DashMap::new(),
            stores: Mutex::new(HashMap::new()),
            factory,
            cluster,
            locks: (0..stripes).map(|_| Mutex::new(())).collect(),
            retention: Duration::from_secs(settings.retention_minutes * 60),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs.max(1)),
            runtime,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Tenant store namespace id.
    pub fn namespace(org: &str) -> String {
        format!("{}__tableCacheStore", org.to_lowercase())
    }

    fn local_key(org: &str, key: &DataKey) -> String {
        format!("{}|{}", Self::namespace(org), key.as_str())
    }

    fn store_key(&self, key: &DataKey) -> String {
        format!("{}:{}", self.cluster.incarnation(), key.as_str())
    }

    fn stripe(&self, key: &DataKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.as_str().hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    /// Cached store handle for a tenant, re-acquired when the handle
    /// reports itself closed.
    fn store_for(&self, org: &str) -> StoreResult<Arc<dyn BlobStore>> {
        let ns = Self::namespace(org);
        let mut stores = self.stores.lock().expect("store map mutex");
        if let Some(existing) = stores.get(&ns) {
            if !existing.closed() {
                return Ok(Arc::clone(existing));
            }
        }
        let fresh = self.factory.open(&ns)?;
        stores.insert(ns, Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Look up a realized table. Store failures degrade to a miss.
    pub fn get(&self, org: &str, key: &DataKey) -> Option<Arc<TableData>> {
        let local_key = Self::local_key(org, key);
        // Fast path: no lock.
        if let Some(hit) = self.local.get(&local_key) {
            return Some(Arc::clone(&hit));
        }

        let store = match self.store_for(org) {
            Ok(s) => s,
            Err(e) => {
                warn!(org, error = %e, "cache store unavailable; treating as miss");
                return None;
            }
        };
        let store_key = self.store_key(key);
        match store.exists(&store_key) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(error = %e, "cache existence check failed; treating as miss");
                return None;
            }
        }

        // Collapse concurrent cold loads for this key.
        let _guard = self.stripe(key).lock().expect("stripe mutex");
        if let Some(hit) = self.local.get(&local_key) {
            return Some(Arc::clone(&hit));
        }
        match store.read(&store_key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<TableData>(&bytes) {
                Ok(data) => {
                    let data = Arc::new(data);
                    self.local.insert(local_key, Arc::clone(&data));
                    Some(data)
                }
                Err(e) => {
                    warn!(error = %e, "cache entry failed to deserialize; treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Store a realized table. The local tier is updated immediately;
    /// the store write runs on the background executor and never
    /// blocks or fails the caller.
    pub fn put(&self, org: &str, key: &DataKey, data: Arc<TableData>) {
        let local_key = Self::local_key(org, key);
        let changed = match self.local.get(&local_key) {
            Some(existing) => existing.content_hash() != data.content_hash(),
            None => true,
        };
        self.local.insert(local_key, Arc::clone(&data));
        if !changed {
            debug!("cache value unchanged; skipping store write");
            return;
        }

        let store = match self.store_for(org) {
            Ok(s) => s,
            Err(e) => {
                warn!(org, error = %e, "cache store unavailable; keeping local only");
                return;
            }
        };
        let bytes = match serde_json::to_vec(&*data) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "cache value failed to serialize; keeping local only");
                return;
            }
        };
        let store_key = self.store_key(key);
        let handle = self.runtime.spawn(async move {
            if let Err(e) = store.write(&store_key, &bytes) {
                warn!(error = %e, "background cache write failed");
            }
        });
        let mut pending = self.pending.lock().expect("pending mutex");
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for all pending background writes to settle. Exists so
    /// callers (and tests) can observe persistence completion.
    pub fn flush(&self) {
        let handles: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending mutex");
            pending.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = futures::executor::block_on(handle) {
                warn!(error = %e, "background cache write panicked");
            }
        }
    }

    /// Drop one entry from both tiers.
    pub fn invalidate(&self, org: &str, key: &DataKey) {
        self.local.remove(&Self::local_key(org, key));
        if let Ok(store) = self.store_for(org) {
            let store_key = self.store_key(key);
            if let Err(e) = store.delete(&store_key) {
                warn!(error = %e, "cache invalidation could not reach the store");
            }
        }
    }

    /// Drop every local entry for a tenant.
    pub fn clear_local(&self, org: &str) {
        let prefix = format!("{}|", Self::namespace(org));
        self.local.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn stats(&self, org: &str) -> CacheStats {
        let prefix = format!("{}|", Self::namespace(org));
        let local_entries = self
            .local
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .count();
        let store_entries = self
            .store_for(org)
            .and_then(|s| s.keys())
            .map(|k| k.len())
            .unwrap_or(0);
        CacheStats {
            local_entries,
            store_entries,
        }
    }

    /// Run one sweep over a tenant's store, if this node owns the
    /// singleton job. Returns `None` when it does not.
    pub fn sweep_once(&self, org: &str) -> Option<SweepStats> {
        if !self.cluster.is_sweep_owner() {
            return None;
        }
        let store = match self.store_for(org) {
            Ok(s) => s,
            Err(e) => {
                warn!(org, error = %e, "sweep could not open store");
                return None;
            }
        };
        match sweep_store(
            store.as_ref(),
            &self.cluster.incarnation(),
            self.retention,
            store::now_secs(),
        ) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(org, error = %e, "cache sweep failed");
                None
            }
        }
    }

    /// Start the periodic sweep task for the given tenants. The task
    /// stops when the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>, orgs: Vec<String>) {
        let weak: Weak<TableCache> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    return;
                };
                for org in &orgs {
                    cache.sweep_once(org);
                }
            }
        });
    }
}
