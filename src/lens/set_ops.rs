//! Union, intersect and minus over row-wise structural equality.

use std::collections::HashSet;

use crate::model::Value;

use super::{row_not_realized, BoxLens, TableLens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union { distinct: bool },
    Intersect,
    Minus,
}

/// Combines two lenses row-wise. Headers come from the left side; both
/// sides must have the same column count.
pub struct SetOpLens {
    left: BoxLens,
    right: BoxLens,
    op: SetOp,
    /// (from_left, base row) per output data row.
    rows: Vec<(bool, usize)>,
    built: bool,
}

impl SetOpLens {
    pub fn new(left: BoxLens, right: BoxLens, op: SetOp) -> Self {
        Self {
            left,
            right,
            op,
            rows: Vec::new(),
            built: false,
        }
    }

    fn drain(lens: &mut BoxLens) -> usize {
        let mut row = 1;
        while lens.more_rows(row) {
            row += 1;
        }
        row - 1
    }

    fn row_key(lens: &dyn TableLens, row: usize) -> Vec<Value> {
        (0..lens.col_count()).map(|c| lens.cell(row, c)).collect()
    }

    fn build(&mut self) {
        if self.built {
            return;
        }
        self.built = true;
        let left_rows = Self::drain(&mut self.left);
        let right_rows = Self::drain(&mut self.right);

        match self.op {
            SetOp::Union { distinct } => {
                let mut seen: HashSet<Vec<Value>> = HashSet::new();
                for l in 1..=left_rows {
                    if !distinct || seen.insert(Self::row_key(self.left.as_ref(), l)) {
                        self.rows.push((true, l));
                    }
                }
                for r in 1..=right_rows {
                    if !distinct || seen.insert(Self::row_key(self.right.as_ref(), r)) {
                        self.rows.push((false, r));
                    }
                }
            }
            SetOp::Intersect => {
                let right_set: HashSet<Vec<Value>> = (1..=right_rows)
                    .map(|r| Self::row_key(self.right.as_ref(), r))
                    .collect();
                let mut emitted: HashSet<Vec<Value>> = HashSet::new();
                for l in 1..=left_rows {
                    let key = Self::row_key(self.left.as_ref(), l);
                    if right_set.contains(&key) && emitted.insert(key) {
                        self.rows.push((true, l));
                    }
                }
            }
            SetOp::Minus => {
                let right_set: HashSet<Vec<Value>> = (1..=right_rows)
                    .map(|r| Self::row_key(self.right.as_ref(), r))
                    .collect();
                let mut emitted: HashSet<Vec<Value>> = HashSet::new();
                for l in 1..=left_rows {
                    let key = Self::row_key(self.left.as_ref(), l);
                    if !right_set.contains(&key) && emitted.insert(key) {
                        self.rows.push((true, l));
                    }
                }
            }
        }
    }
}

impl TableLens for SetOpLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.build();
        row <= self.rows.len()
    }

    fn row_count(&self) -> usize {
        self.rows.len() + 1
    }

    fn col_count(&self) -> usize {
        self.left.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        if row == 0 {
            return self.left.cell(0, col);
        }
        match self.rows.get(row - 1) {
            Some(&(true, r)) => self.left.cell(r, col),
            Some(&(false, r)) => self.right.cell(r, col),
            None => row_not_realized(row),
        }
    }

    fn dispose(&mut self) {
        self.left.dispose();
        self.right.dispose();
    }
}
