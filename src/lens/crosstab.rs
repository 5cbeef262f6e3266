//! Cross-tab tree collapse.
//!
//! Driven by an externally supplied expand/collapse tree over the row
//! group hierarchy: every descendant row of a collapsed group node
//! collapses into a single row whose detail cells show a synthetic
//! placeholder. Header rows pass through unmodified.

use std::collections::HashSet;

use crate::model::Value;

use super::{row_not_realized, BoxLens, LensCaps, Span, TableLens};

/// Placeholder shown for cells hidden by a collapsed group.
pub const COLLAPSED_PLACEHOLDER: &str = "+";

/// Collapsed group paths. A path is the sequence of group-column
/// values leading to the collapsed node.
#[derive(Debug, Clone, Default)]
pub struct CollapseTree {
    collapsed: HashSet<Vec<Value>>,
}

impl CollapseTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collapse(&mut self, path: Vec<Value>) {
        self.collapsed.insert(path);
    }

    pub fn expand(&mut self, path: &[Value]) {
        self.collapsed.remove(path);
    }

    /// Length of the shortest collapsed prefix of `path`, if any.
    fn collapsed_depth(&self, path: &[Value]) -> Option<usize> {
        (1..=path.len()).find(|&n| self.collapsed.contains(&path[..n]))
    }
}

/// Applies a collapse tree to a cross-tab shaped base lens.
pub struct CrossTabFilterLens {
    base: BoxLens,
    tree: CollapseTree,
    /// Row-header columns forming the group hierarchy, outermost first.
    group_cols: Vec<usize>,
    caps: LensCaps,
    /// (base row, collapse depth) per output row; depth = group_cols
    /// length when the row is fully expanded.
    rows: Vec<(usize, usize)>,
    built: bool,
}

impl CrossTabFilterLens {
    pub fn new(base: BoxLens, group_cols: Vec<usize>, tree: CollapseTree) -> Self {
        let caps = base.caps();
        Self {
            base,
            tree,
            group_cols,
            caps,
            rows: Vec::new(),
            built: false,
        }
    }

    fn path_of(&self, row: usize) -> Vec<Value> {
        self.group_cols
            .iter()
            .map(|&c| self.base.cell(row, c))
            .collect()
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

        for r in 0..pinned.min(total) {
            self.rows.push((r, self.group_cols.len()));
        }

        let mut emitted_collapsed: HashSet<Vec<Value>> = HashSet::new();
        for r in pinned..total {
            let path = self.path_of(r);
            match self.tree.collapsed_depth(&path) {
                None => self.rows.push((r, self.group_cols.len())),
                Some(depth) => {
                    let prefix = path[..depth].to_vec();
                    if emitted_collapsed.insert(prefix) {
                        self.rows.push((r, depth));
                    }
                }
            }
        }
    }
}

impl TableLens for CrossTabFilterLens {
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
        let Some(&(base_row, depth)) = self.rows.get(row) else {
            row_not_realized(row)
        };
        // Header rows (row 0 in particular) are passed through as-is.
        if row < self.caps.header_rows.max(1) {
            return self.base.cell(base_row, col);
        }
        if depth < self.group_cols.len() {
            // Cells deeper than the collapse point show the placeholder:
            // the remaining group levels and every non-group column.
            let hidden = self.group_cols[depth..].contains(&col)
                || !self.group_cols.contains(&col);
            if hidden {
                return Value::Str(COLLAPSED_PLACEHOLDER.to_string());
            }
        }
        self.base.cell(base_row, col)
    }

    fn span(&self, row: usize, col: usize) -> Option<Span> {
        self.rows
            .get(row)
            .and_then(|&(base_row, _)| self.base.span(base_row, col))
    }

    fn caps(&self) -> LensCaps {
        self.caps
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
