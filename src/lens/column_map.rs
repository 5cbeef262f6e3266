//! Column projection/reordering by explicit index array.

use crate::model::Value;

use super::{BoxLens, LensCaps, Span, TableLens};

/// Reorders, hides and exposes columns of the base lens. Used heavily
/// to normalize a result back to the caller's expected column order
/// after a cache-friendly internal reordering.
pub struct ColumnMapLens {
    base: BoxLens,
    /// Output column -> base column.
    mapping: Vec<usize>,
}

impl ColumnMapLens {
    pub fn new(base: BoxLens, mapping: Vec<usize>) -> Self {
        Self { base, mapping }
    }
}

impl TableLens for ColumnMapLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.base.more_rows(row)
    }

    fn row_count(&self) -> usize {
        self.base.row_count()
    }

    fn col_count(&self) -> usize {
        self.mapping.len()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        self.base.cell(row, self.mapping[col])
    }

    fn span(&self, row: usize, col: usize) -> Option<Span> {
        self.base.span(row, self.mapping[col])
    }

    fn caps(&self) -> LensCaps {
        self.base.caps()
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}

/// Replaces the header row, leaving data untouched. Restores the
/// caller's requested headers after alias-stripping normalization.
pub struct RelabelLens {
    base: BoxLens,
    headers: Vec<String>,
}

impl RelabelLens {
    pub fn new(base: BoxLens, headers: Vec<String>) -> Self {
        Self { base, headers }
    }
}

impl TableLens for RelabelLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.base.more_rows(row)
    }

    fn row_count(&self) -> usize {
        self.base.row_count()
    }

    fn col_count(&self) -> usize {
        self.base.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        if row == 0 {
            match self.headers.get(col) {
                Some(h) => Value::Str(h.clone()),
                None => self.base.cell(0, col),
            }
        } else {
            self.base.cell(row, col)
        }
    }

    fn span(&self, row: usize, col: usize) -> Option<Span> {
        self.base.span(row, col)
    }

    fn caps(&self) -> LensCaps {
        self.base.caps()
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
