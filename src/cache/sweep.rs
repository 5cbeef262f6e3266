//! Background cleanup sweep.
//!
//! Runs on exactly one node at a time (the cluster's scheduling
//! primitive decides which). A sweep scans a tenant's store and
//! deletes entries that belong to another cluster incarnation or are
//! older than the retention window. Entries that vanish mid-scan are
//! treated as already gone.

use std::time::Duration;

use tracing::{debug, warn};

use super::store::{BlobStore, StoreResult};

/// Outcome of one sweep pass over one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub deleted_foreign: usize,
    pub deleted_expired: usize,
}

/// Sweep one store. `incarnation` is the running cluster incarnation;
/// keys are prefixed with it at write time.
pub fn sweep_store(
    store: &dyn BlobStore,
    incarnation: &str,
    retention: Duration,
    now_secs: i64,
) -> StoreResult<SweepStats> {
    let mut stats = SweepStats::default();
    let prefix = format!("{}:", incarnation);
    let cutoff = now_secs - retention.as_secs() as i64;

    for key in store.keys()? {
        stats.scanned += 1;
        if !key.starts_with(&prefix) {
            store.delete(&key)?;
            stats.deleted_foreign += 1;
            continue;
        }
        match store.last_modified(&key) {
            Ok(Some(modified)) if modified < cutoff => {
                store.delete(&key)?;
                stats.deleted_expired += 1;
            }
            Ok(Some(_)) => {}
            // Already gone: someone else cleaned it up first.
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %e, "could not stat cache entry during sweep");
            }
        }
    }

    debug!(
        scanned = stats.scanned,
        foreign = stats.deleted_foreign,
        expired = stats.deleted_expired,
        "cache sweep complete"
    );
    Ok(stats)
}
