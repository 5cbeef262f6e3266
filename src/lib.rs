//! # Tessera
//!
//! Query-execution core for a viewsheet/report engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        TableAssembly (logical query plan node)           │
//! │  (columns, conditions, aggregation, sort, max rows)      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [merge planner]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Statement (pushed-down clauses)  +  residual PostOps   │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [data source + operator chain]
//! ┌─────────────────────────────────────────────────────────┐
//! │           TableLens (lazy, composable table)             │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [fingerprint + layered cache]
//! ┌─────────────────────────────────────────────────────────┐
//! │   process map ──▶ tenant blob store (sweep, expiry)      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The merge planner decides, per assembly kind, how much of a logical
//! query can travel into the generated statement versus being
//! evaluated locally by chained table lenses. Results are fingerprinted
//! and shared across requests through a two-tier cache. Selection
//! (facet) metadata for dashboard widgets derives from the same
//! lenses.

pub mod cache;
pub mod config;
pub mod lens;
pub mod model;
pub mod planner;
pub mod resolve;
pub mod runtime;
pub mod selection;
pub mod sql;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::cache::{DataKey, TableCache};
    pub use crate::config::Settings;
    pub use crate::lens::{BoxLens, MemoryLens, TableData, TableLens};
    pub use crate::model::{
        AggregateFormula, AggregateSpec, AssemblyKind, ColumnRef, ColumnSelection, CompareOp,
        Comparison, ConditionNode, DataType, ExecMode, Operand, SortKey, SourceInfo,
        TableAssembly, Value,
    };
    pub use crate::planner::{MergePhase, MergePlanner, PlanContext, PostOp, QueryPlan};
    pub use crate::runtime::{DataSource, ExecutionContext, Sandbox, TableService};
    pub use crate::sql::{Dialect, Statement};
}

pub use model::{TableAssembly, Value};
pub use runtime::{ExecutionContext, Sandbox, TableService};
