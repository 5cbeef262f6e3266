//! Row-count truncation.

use crate::model::Value;

use super::{BoxLens, LensCaps, Span, TableLens};

/// Truncates the base after `max` data rows without requiring upstream
/// exhaustion. A max of 0 means unlimited.
pub struct MaxRowsLens {
    base: BoxLens,
    max: usize,
}

impl MaxRowsLens {
    pub fn new(base: BoxLens, max: usize) -> Self {
        Self { base, max }
    }
}

impl TableLens for MaxRowsLens {
    fn more_rows(&mut self, row: usize) -> bool {
        if self.max > 0 && row > self.max {
            return false;
        }
        self.base.more_rows(row)
    }

    fn row_count(&self) -> usize {
        match self.max {
            0 => self.base.row_count(),
            max => self.base.row_count().min(max + 1),
        }
    }

    fn col_count(&self) -> usize {
        self.base.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        self.base.cell(row, col)
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
