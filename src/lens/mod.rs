//! Lazy table lenses.
//!
//! A `TableLens` is a randomly-indexable logical table whose rows are
//! realized incrementally. Row 0 is the header row; data rows follow.
//! Lenses wrap other lenses to form a transform pipeline: each operator
//! file in this module implements one transform over a base lens.
//!
//! The availability contract: callers must check `more_rows(row)` before
//! touching `cell(row, _)`. Reading an unrealized row is a programmer
//! error and panics; lenses never silently clamp. Operators do all of
//! their bookkeeping inside `more_rows`, so repeated `cell` reads are
//! pure.
//!
//! Disposal propagates down the chain. Errors during disposal are
//! logged, never raised: disposal runs while unwinding already-failed
//! paths.

mod column_map;
mod crosstab;
mod distinct;
mod filter;
mod formula;
mod join;
mod max_rows;
mod rotate;
mod set_ops;
mod sort;
mod summary;

pub use column_map::{ColumnMapLens, RelabelLens};
pub use crosstab::{CollapseTree, CrossTabFilterLens, COLLAPSED_PLACEHOLDER};
pub use distinct::DistinctLens;
pub use filter::FilterLens;
pub use formula::{FormulaColumn, FormulaLens};
pub use join::{JoinKind, JoinLens};
pub use max_rows::MaxRowsLens;
pub use rotate::RotateLens;
pub use set_ops::{SetOp, SetOpLens};
pub use sort::{SortComparer, SortLens};
pub use summary::SummaryLens;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::Value;

/// A merged cell region anchored at its top-left cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub rows: usize,
    pub cols: usize,
}

/// Structural capabilities, probed once at chain construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LensCaps {
    /// Rows pinned at the top: 1 for plain tables, more for cross-tabs.
    pub header_rows: usize,
    /// Cross-tab shaped: grouped header rows/columns with spans.
    pub crosstab: bool,
}

impl Default for LensCaps {
    fn default() -> Self {
        Self {
            header_rows: 1,
            crosstab: false,
        }
    }
}

/// The lazy, randomly-indexable logical table.
pub trait TableLens {
    /// Ensure rows `0..=row` are realized. Returns false when the table
    /// ends before `row`. After a false return, `row_count` is final.
    fn more_rows(&mut self, row: usize) -> bool;

    /// Rows realized so far, including the header row.
    fn row_count(&self) -> usize;

    fn col_count(&self) -> usize;

    /// Read a realized cell. Panics if the row has not been realized;
    /// callers must gate on `more_rows` first.
    fn cell(&self, row: usize, col: usize) -> Value;

    /// Merged-span metadata for a cell, if any.
    fn span(&self, _row: usize, _col: usize) -> Option<Span> {
        None
    }

    fn caps(&self) -> LensCaps {
        LensCaps::default()
    }

    /// Release upstream resources. Must propagate to the base lens.
    fn dispose(&mut self) {}
}

pub type BoxLens = Box<dyn TableLens>;

/// Panic message for availability-contract violations.
#[track_caller]
pub(crate) fn row_not_realized(row: usize) -> ! {
    panic!(
        "row {} read before being realized; call more_rows first",
        row
    )
}

/// Read the header row of a lens.
pub fn header_names(lens: &mut dyn TableLens) -> Vec<String> {
    if !lens.more_rows(0) {
        return Vec::new();
    }
    (0..lens.col_count())
        .map(|c| lens.cell(0, c).to_display())
        .collect()
}

/// A fully realized table: the value stored in caches and behind
/// embedded datasets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<SpanEntry>,
}

/// A span record in a realized table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEntry {
    pub row: usize,
    pub col: usize,
    pub span: Span,
}

impl TableData {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            headers,
            rows,
            spans: Vec::new(),
        }
    }

    pub fn col_count(&self) -> usize {
        self.headers.len()
    }

    /// Data row count, excluding the header row.
    pub fn data_rows(&self) -> usize {
        self.rows.len()
    }

    /// Deterministic content hash, used to decide whether a cache
    /// write-through is needed.
    pub fn content_hash(&self) -> String {
        crate::cache::content_hash(self).unwrap_or_default()
    }
}

/// Drain a lens into a realized table. `max_rows` of 0 means unlimited;
/// the bool is true when the limit truncated the result.
pub fn materialize(lens: &mut dyn TableLens, max_rows: usize) -> (TableData, bool) {
    let headers = header_names(lens);
    let cols = headers.len();
    let mut rows = Vec::new();
    let mut row = 1;
    let mut truncated = false;
    while lens.more_rows(row) {
        if max_rows > 0 && rows.len() >= max_rows {
            truncated = true;
            break;
        }
        rows.push((0..cols).map(|c| lens.cell(row, c)).collect());
        row += 1;
    }
    let mut data = TableData::new(headers, rows);
    // Carry span metadata for the realized region.
    let mut spans = Vec::new();
    for r in 0..data.data_rows() + 1 {
        for c in 0..cols {
            if let Some(span) = lens.span(r, c) {
                spans.push(SpanEntry {
                    row: r,
                    col: c,
                    span,
                });
            }
        }
    }
    data.spans = spans;
    (data, truncated)
}

/// Lens over a realized table. This is the leaf of most chains: cached
/// results, embedded datasets and source scan results all surface
/// through it.
pub struct MemoryLens {
    data: Arc<TableData>,
    caps: LensCaps,
    span_index: HashMap<(usize, usize), Span>,
}

impl MemoryLens {
    pub fn new(data: Arc<TableData>) -> Self {
        let span_index = data
            .spans
            .iter()
            .map(|e| ((e.row, e.col), e.span))
            .collect();
        Self {
            data,
            caps: LensCaps::default(),
            span_index,
        }
    }

    pub fn with_caps(mut self, caps: LensCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn data(&self) -> &Arc<TableData> {
        &self.data
    }
}

impl TableLens for MemoryLens {
    fn more_rows(&mut self, row: usize) -> bool {
        row <= self.data.data_rows()
    }

    fn row_count(&self) -> usize {
        self.data.data_rows() + 1
    }

    fn col_count(&self) -> usize {
        self.data.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        if row == 0 {
            return Value::Str(self.data.headers[col].clone());
        }
        if row > self.data.data_rows() {
            row_not_realized(row);
        }
        self.data.rows[row - 1][col].clone()
    }

    fn span(&self, row: usize, col: usize) -> Option<Span> {
        self.span_index.get(&(row, col)).copied()
    }

    fn caps(&self) -> LensCaps {
        self.caps
    }
}

/// Find the column index for an output name in a lens's header row.
pub fn column_index(lens: &mut dyn TableLens, name: &str) -> Option<usize> {
    if !lens.more_rows(0) {
        return None;
    }
    let cols = lens.col_count();
    (0..cols).find(|&c| lens.cell(0, c).to_display() == name)
}
