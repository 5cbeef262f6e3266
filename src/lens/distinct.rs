//! Duplicate elimination by a column subset.

use std::collections::HashSet;

use crate::model::Value;

use super::{row_not_realized, BoxLens, LensCaps, TableLens};

/// Keeps the first occurrence of each distinct key. The key is the
/// whole row when no column subset is given. Comparison is type-aware
/// through `Value`'s ordering (1 and 1.0 collapse).
pub struct DistinctLens {
    base: BoxLens,
    key_cols: Option<Vec<usize>>,
    rows: Vec<usize>,
    seen: HashSet<Vec<Value>>,
    next_base: usize,
    exhausted: bool,
}

impl DistinctLens {
    pub fn new(base: BoxLens, key_cols: Option<Vec<usize>>) -> Self {
        Self {
            base,
            key_cols,
            rows: vec![0],
            seen: HashSet::new(),
            next_base: 1,
            exhausted: false,
        }
    }

    fn key_of(&self, row: usize) -> Vec<Value> {
        match &self.key_cols {
            Some(cols) => cols.iter().map(|&c| self.base.cell(row, c)).collect(),
            None => (0..self.base.col_count())
                .map(|c| self.base.cell(row, c))
                .collect(),
        }
    }
}

impl TableLens for DistinctLens {
    fn more_rows(&mut self, row: usize) -> bool {
        while self.rows.len() <= row {
            if self.exhausted {
                return false;
            }
            if !self.base.more_rows(self.next_base) {
                self.exhausted = true;
                return false;
            }
            let r = self.next_base;
            self.next_base += 1;
            let key = self.key_of(r);
            if self.seen.insert(key) {
                self.rows.push(r);
            }
        }
        true
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn col_count(&self) -> usize {
        self.base.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        match self.rows.get(row) {
            Some(&base_row) => self.base.cell(base_row, col),
            None => row_not_realized(row),
        }
    }

    fn caps(&self) -> LensCaps {
        self.base.caps()
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
