//! Cross and key-equality joins.

use std::collections::HashMap;

use crate::model::Value;

use super::{row_not_realized, BoxLens, TableLens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Cross,
    Inner,
    Left,
    Right,
    Full,
}

/// Joins two lenses. Output column order is left columns followed by
/// right columns. Both sides are drained incrementally on first access;
/// unmatched sides of outer joins surface as nulls.
pub struct JoinLens {
    left: BoxLens,
    right: BoxLens,
    kind: JoinKind,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    /// (left base row, right base row) per output data row.
    pairs: Vec<(Option<usize>, Option<usize>)>,
    built: bool,
}

impl JoinLens {
    pub fn cross(left: BoxLens, right: BoxLens) -> Self {
        Self::new(left, right, JoinKind::Cross, vec![], vec![])
    }

    pub fn new(
        left: BoxLens,
        right: BoxLens,
        kind: JoinKind,
        left_keys: Vec<usize>,
        right_keys: Vec<usize>,
    ) -> Self {
        Self {
            left,
            right,
            kind,
            left_keys,
            right_keys,
            pairs: Vec::new(),
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

    fn key_of(lens: &dyn TableLens, row: usize, keys: &[usize]) -> Vec<Value> {
        keys.iter().map(|&c| lens.cell(row, c)).collect()
    }

    fn build(&mut self) {
        if self.built {
            return;
        }
        self.built = true;
        let left_rows = Self::drain(&mut self.left);
        let right_rows = Self::drain(&mut self.right);

        if self.kind == JoinKind::Cross {
            for l in 1..=left_rows {
                for r in 1..=right_rows {
                    self.pairs.push((Some(l), Some(r)));
                }
            }
            return;
        }

        let mut right_index: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for r in 1..=right_rows {
            let key = Self::key_of(self.right.as_ref(), r, &self.right_keys);
            right_index.entry(key).or_default().push(r);
        }

        let mut matched_right = vec![false; right_rows + 1];
        for l in 1..=left_rows {
            let key = Self::key_of(self.left.as_ref(), l, &self.left_keys);
            match right_index.get(&key) {
                Some(rs) => {
                    for &r in rs {
                        matched_right[r] = true;
                        self.pairs.push((Some(l), Some(r)));
                    }
                }
                None => {
                    if matches!(self.kind, JoinKind::Left | JoinKind::Full) {
                        self.pairs.push((Some(l), None));
                    }
                }
            }
        }
        if matches!(self.kind, JoinKind::Right | JoinKind::Full) {
            for r in 1..=right_rows {
                if !matched_right[r] {
                    self.pairs.push((None, Some(r)));
                }
            }
        }
    }
}

impl TableLens for JoinLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.build();
        row <= self.pairs.len()
    }

    fn row_count(&self) -> usize {
        self.pairs.len() + 1
    }

    fn col_count(&self) -> usize {
        self.left.col_count() + self.right.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        let left_cols = self.left.col_count();
        if row == 0 {
            return if col < left_cols {
                self.left.cell(0, col)
            } else {
                self.right.cell(0, col - left_cols)
            };
        }
        let Some(&(l, r)) = self.pairs.get(row - 1) else {
            row_not_realized(row)
        };
        if col < left_cols {
            match l {
                Some(lr) => self.left.cell(lr, col),
                None => Value::Null,
            }
        } else {
            match r {
                Some(rr) => self.right.cell(rr, col - left_cols),
                None => Value::Null,
            }
        }
    }

    fn dispose(&mut self) {
        self.left.dispose();
        self.right.dispose();
    }
}
