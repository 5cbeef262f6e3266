//! Stable multi-key sorting.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::model::Value;

use super::{row_not_realized, BoxLens, LensCaps, Span, TableLens};

/// Custom per-key comparer.
pub type SortComparer = Box<dyn Fn(&Value, &Value) -> Ordering>;

struct KeySpec {
    col: usize,
    ascending: bool,
    comparer: Option<SortComparer>,
}

/// Sorts data rows by one or more keys, stably. Header rows (all of
/// them, for cross-tab shaped bases) are pinned and excluded from
/// reordering. For cross-tab bases the sort-key columns get their
/// vertical spans recomputed so grouped blocks stay contiguous after
/// the reorder.
pub struct SortLens {
    base: BoxLens,
    keys: Vec<KeySpec>,
    caps: LensCaps,
    /// Output row -> base row, filled on first access.
    rows: Vec<usize>,
    /// Recomputed spans for cross-tab bases.
    spans: HashMap<(usize, usize), Span>,
    built: bool,
}

impl SortLens {
    pub fn new(base: BoxLens, keys: Vec<(usize, bool)>) -> Self {
        let caps = base.caps();
        Self {
            base,
            keys: keys
                .into_iter()
                .map(|(col, ascending)| KeySpec {
                    col,
                    ascending,
                    comparer: None,
                })
                .collect(),
            caps,
            rows: Vec::new(),
            spans: HashMap::new(),
            built: false,
        }
    }

    /// Attach a custom comparer to the key at `index`.
    pub fn with_comparer(mut self, index: usize, comparer: SortComparer) -> Self {
        if let Some(key) = self.keys.get_mut(index) {
            key.comparer = Some(comparer);
        }
        self
    }

    fn build(&mut self) {
        if self.built {
            return;
        }
        self.built = true;

        let pinned = self.caps.header_rows.max(1);
        let mut row = 0;
        while self.base.more_rows(row) {
            row += 1;
        }
        let total = row;

        self.rows = (0..pinned.min(total)).collect();
        let mut data: Vec<usize> = (pinned..total).collect();

        data.sort_by(|&a, &b| {
            for key in &self.keys {
                let va = self.base.cell(a, key.col);
                let vb = self.base.cell(b, key.col);
                let ord = match &key.comparer {
                    Some(f) => f(&va, &vb),
                    None => va.cmp(&vb),
                };
                let ord = if key.ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        self.rows.extend(data);

        if self.caps.crosstab {
            self.rebuild_spans(pinned, total);
        }
    }

    /// Merge runs of equal sort-key values back into vertical spans.
    fn rebuild_spans(&mut self, pinned: usize, total: usize) {
        for key in &self.keys {
            let mut run_start = pinned;
            let mut run_value: Option<Value> = None;
            for out_row in pinned..=total {
                let value = if out_row < total {
                    Some(self.base.cell(self.rows[out_row], key.col))
                } else {
                    None
                };
                if value != run_value {
                    if run_value.is_some() {
                        let len = out_row - run_start;
                        if len > 1 {
                            self.spans
                                .insert((run_start, key.col), Span { rows: len, cols: 1 });
                        }
                    }
                    run_start = out_row;
                    run_value = value;
                }
            }
        }
    }
}

impl TableLens for SortLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.build();
        row < self.rows.len()
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

    fn span(&self, row: usize, col: usize) -> Option<Span> {
        if self.caps.crosstab {
            if row >= self.caps.header_rows && self.keys.iter().any(|k| k.col == col) {
                return self.spans.get(&(row, col)).copied();
            }
        }
        self.rows
            .get(row)
            .and_then(|&base_row| self.base.span(base_row, col))
    }

    fn caps(&self) -> LensCaps {
        self.caps
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
