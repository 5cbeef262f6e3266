//! Request execution: contexts, the sandbox, and the table service.

mod context;
mod sandbox;
mod service;

pub use context::ExecutionContext;
pub use sandbox::{Sandbox, SandboxError, SandboxView};
pub use service::{DataSource, Repository, TableService, VpmProcessor};

use thiserror::Error;

/// Errors surfaced to callers of the table service.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The request was cancelled. Expected condition, not a failure;
    /// callers abandon the partial result.
    #[error("query cancelled")]
    Cancelled,

    #[error("unknown assembly: {0}")]
    UnknownAssembly(String),

    /// User-facing: the bound source/model cannot be resolved.
    #[error("data source not found: {0}")]
    SourceNotFound(String),

    #[error("data source error: {0}")]
    Source(String),

    #[error(transparent)]
    Plan(#[from] crate::planner::PlanError),

    #[error(transparent)]
    Sql(#[from] crate::sql::SqlError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
