//! Per-request execution context.
//!
//! Everything that used to be ambient (thread-locals, global flags)
//! travels on this object instead: user identity, variable bindings,
//! execution mode, the materialized-view-snapshot flag, cancellation,
//! and the notices accumulated for the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::{ExecMode, Value};
use crate::sql::Dialect;

#[derive(Debug)]
pub struct ExecutionContext {
    pub user: String,
    /// Tenant/organization id; namespaces all cached state.
    pub org: String,
    pub variables: BTreeMap<String, Value>,
    pub mode: ExecMode,
    pub dialect: Dialect,

    /// Formatted-output request (part of the fingerprint).
    pub formatted: bool,
    /// Row bound requested by the embedding input, 0 = none.
    pub input_max: usize,
    /// Preview row bound, 0 = none.
    pub preview_max: usize,
    /// Build the result ignoring the assembly's own filters.
    pub ignore_filtering: bool,

    /// Row/column security rewriting is active for this request.
    pub vpm_enabled: bool,
    /// This request is building a materialized-view snapshot.
    pub mv_snapshot: bool,

    cancelled: Arc<AtomicBool>,
    notices: Mutex<Vec<String>>,
}

impl ExecutionContext {
    pub fn new(user: &str, org: &str) -> Self {
        Self {
            user: user.to_string(),
            org: org.to_string(),
            variables: BTreeMap::new(),
            mode: ExecMode::Runtime,
            dialect: Dialect::default(),
            formatted: false,
            input_max: 0,
            preview_max: 0,
            ignore_filtering: false,
            vpm_enabled: false,
            mv_snapshot: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    /// Handle another thread can use to cancel this request.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Append a user-visible notice (truncations, degradations).
    pub fn push_notice(&self, notice: String) {
        self.notices.lock().expect("notice mutex").push(notice);
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().expect("notice mutex").clone()
    }
}
