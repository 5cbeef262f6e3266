//! Orientation rotation (transpose).

use crate::model::Value;

use super::{row_not_realized, BoxLens, TableLens};

/// Pivots table orientation: output cell (r, c) is base cell (c, r),
/// so the base's first column becomes the new header row. Inherently
/// eager: the base is drained on first access.
pub struct RotateLens {
    base: BoxLens,
    base_rows: usize,
    built: bool,
}

impl RotateLens {
    pub fn new(base: BoxLens) -> Self {
        Self {
            base,
            base_rows: 0,
            built: false,
        }
    }

    fn build(&mut self) {
        if self.built {
            return;
        }
        self.built = true;
        let mut row = 0;
        while self.base.more_rows(row) {
            row += 1;
        }
        self.base_rows = row;
    }
}

impl TableLens for RotateLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.build();
        row < self.base.col_count()
    }

    fn row_count(&self) -> usize {
        self.base.col_count()
    }

    fn col_count(&self) -> usize {
        self.base_rows
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        if row >= self.base.col_count() {
            row_not_realized(row);
        }
        self.base.cell(col, row)
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
