//! Selection (facet) metadata.
//!
//! Derives the value lists behind interactive filter widgets from an
//! association-scanned table: which values the user picked, which are
//! still reachable given every other widget's selections, which are
//! safe to auto-highlight, and which are excluded. List widgets get a
//! flat value list; tree widgets get a parent/child hierarchy built
//! from id columns, with a hard recursion cap against malformed
//! parent-id cycles.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SelectionSettings;
use crate::lens::TableLens;
use crate::model::Value;

/// Selection state bits. The builder assigns exactly one per value.
pub mod state {
    /// The user chose this value.
    pub const SELECTED: u8 = 0x1;
    /// Still reachable given other active selections.
    pub const COMPATIBLE: u8 = 0x2;
    /// Compatible, and no conflicting selection exists elsewhere.
    pub const INCLUDED: u8 = 0x4;
    /// Not reachable given other active selections.
    pub const EXCLUDED: u8 = 0x8;
}

/// Parent-id recursion guard for tree assembly.
const MAX_TREE_DEPTH: usize = 100;

/// One facet value, possibly with children (tree widgets).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionValue {
    pub value: Value,
    pub state: u8,
    /// Optional associated measure (e.g. a count or sum shown beside
    /// the value).
    pub measure: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SelectionValue>,
}

impl SelectionValue {
    fn new(value: Value, state: u8, measure: Option<Value>) -> Self {
        Self {
            value,
            state,
            measure,
            children: Vec::new(),
        }
    }

    pub fn is_selected(&self) -> bool {
        self.state & state::SELECTED != 0
    }

    /// Compatible in the widest sense: anything not excluded.
    pub fn is_reachable(&self) -> bool {
        self.state & state::EXCLUDED == 0
    }
}

/// A built facet value list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionList {
    pub values: Vec<SelectionValue>,
    /// Single-selection widgets carry at most one SELECTED value.
    pub single: bool,
}

impl SelectionList {
    /// All values in the list, depth-first.
    pub fn flattened(&self) -> Vec<&SelectionValue> {
        let mut out = Vec::new();
        fn walk<'a>(values: &'a [SelectionValue], out: &mut Vec<&'a SelectionValue>) {
            for v in values {
                out.push(v);
                walk(&v.children, out);
            }
        }
        walk(&self.values, &mut out);
        out
    }

    pub fn selected_values(&self) -> Vec<&Value> {
        self.flattened()
            .into_iter()
            .filter(|v| v.is_selected())
            .map(|v| &v.value)
            .collect()
    }
}

/// Inputs describing the cooperating widgets' current state.
#[derive(Debug, Clone, Default)]
pub struct AssociationInput {
    /// Values the user has chosen in this widget.
    pub applied: HashSet<Value>,
    /// Values present in the association-filtered scan: reachable
    /// given every other widget's selections. `None` means no other
    /// widget constrains this one.
    pub associated: Option<HashSet<Value>>,
    /// Whether any other widget holds a selection that conflicts with
    /// auto-highlighting here.
    pub has_conflicting: bool,
}

/// Builds facet metadata from scanned tables.
pub struct SelectionBuilder<'a> {
    settings: &'a SelectionSettings,
}

impl<'a> SelectionBuilder<'a> {
    pub fn new(settings: &'a SelectionSettings) -> Self {
        Self { settings }
    }

    fn state_of(&self, value: &Value, input: &AssociationInput) -> u8 {
        if input.applied.contains(value) {
            return state::SELECTED;
        }
        if !self.settings.association_mode {
            // Association disabled: no cross-filtering, everything is
            // reachable.
            return state::COMPATIBLE;
        }
        match &input.associated {
            None => state::COMPATIBLE,
            Some(assoc) if assoc.contains(value) => {
                if input.has_conflicting {
                    state::COMPATIBLE
                } else {
                    state::INCLUDED
                }
            }
            Some(_) => state::EXCLUDED,
        }
    }

    /// Build a flat value list from a scan. `value_col` holds the
    /// distinct values; `measure_col` an optional measure to carry
    /// along. Distinctness is enforced here: the scan may repeat
    /// values.
    pub fn build_list(
        &self,
        scan: &mut dyn TableLens,
        value_col: usize,
        measure_col: Option<usize>,
        input: &AssociationInput,
        single: bool,
    ) -> SelectionList {
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        let mut row = 1;
        while scan.more_rows(row) {
            let value = scan.cell(row, value_col);
            row += 1;
            if !seen.insert(value.clone()) {
                continue;
            }
            let measure = measure_col.map(|c| scan.cell(row - 1, c));
            let st = self.state_of(&value, input);
            values.push(SelectionValue::new(value, st, measure));
        }

        let mut list = SelectionList { values, single };
        if single {
            self.enforce_single(&mut list);
        }
        list
    }

    /// Build a tree from a scan with id and parent-id columns. Parent
    /// chains deeper than the recursion cap are truncated with a
    /// warning rather than looping.
    #[allow(clippy::too_many_arguments)]
    pub fn build_tree(
        &self,
        scan: &mut dyn TableLens,
        value_col: usize,
        id_col: usize,
        parent_col: usize,
        measure_col: Option<usize>,
        input: &AssociationInput,
        single: bool,
    ) -> SelectionList {
        // Collect one node per distinct id.
        let mut order = Vec::new();
        let mut nodes: HashMap<Value, (Value, Option<Value>, Option<Value>)> = HashMap::new();
        let mut row = 1;
        while scan.more_rows(row) {
            let id = scan.cell(row, id_col);
            if !nodes.contains_key(&id) {
                let value = scan.cell(row, value_col);
                let parent = match scan.cell(row, parent_col) {
                    Value::Null => None,
                    p => Some(p),
                };
                let measure = measure_col.map(|c| scan.cell(row, c));
                nodes.insert(id.clone(), (value, parent, measure));
                order.push(id);
            }
            row += 1;
        }

        let ids: HashSet<&Value> = order.iter().collect();
        let mut children: HashMap<Value, Vec<Value>> = HashMap::new();
        let mut roots = Vec::new();
        for id in &order {
            let (_, parent, _) = &nodes[id];
            match parent {
                // A parent pointing at itself or at a missing id roots
                // the node instead of orphaning it.
                Some(p) if ids.contains(p) && p != id => {
                    children.entry(p.clone()).or_default().push(id.clone());
                }
                _ => roots.push(id.clone()),
            }
        }

        let mut assembled: HashSet<Value> = HashSet::new();
        let mut values = Vec::new();
        for root in &roots {
            if let Some(v) =
                self.assemble(root, &nodes, &children, input, &mut assembled, 0)
            {
                values.push(v);
            }
        }
        if assembled.len() < order.len() {
            warn!(
                dropped = order.len() - assembled.len(),
                "selection tree contains unreachable nodes (parent-id cycle); truncated"
            );
        }

        let mut list = SelectionList { values, single };
        // Child selections bubble up before single-selection pruning.
        for v in &mut list.values {
            propagate_selected(v);
        }
        if single {
            self.enforce_single(&mut list);
        }
        list
    }

    fn assemble(
        &self,
        id: &Value,
        nodes: &HashMap<Value, (Value, Option<Value>, Option<Value>)>,
        children: &HashMap<Value, Vec<Value>>,
        input: &AssociationInput,
        assembled: &mut HashSet<Value>,
        depth: usize,
    ) -> Option<SelectionValue> {
        if depth >= MAX_TREE_DEPTH {
            warn!("selection tree exceeded depth cap; truncating branch");
            return None;
        }
        if !assembled.insert(id.clone()) {
            return None;
        }
        let (value, _, measure) = nodes.get(id)?.clone();
        let st = self.state_of(&value, input);
        let mut node = SelectionValue::new(value, st, measure);
        if let Some(kids) = children.get(id) {
            for kid in kids {
                if let Some(child) =
                    self.assemble(kid, nodes, children, input, assembled, depth + 1)
                {
                    node.children.push(child);
                }
            }
        }
        Some(node)
    }

    /// Single-selection widgets end with exactly one SELECTED value:
    /// the first one wins, and when none exists the first reachable
    /// value is auto-selected under the select-first policy.
    fn enforce_single(&self, list: &mut SelectionList) {
        let mut found = false;
        fn demote(values: &mut [SelectionValue], found: &mut bool) {
            for v in values {
                if v.is_selected() {
                    if *found {
                        v.state = state::COMPATIBLE;
                    } else {
                        *found = true;
                    }
                }
                demote(&mut v.children, found);
            }
        }
        demote(&mut list.values, &mut found);

        if !found && self.settings.select_first_item {
            fn select_first(values: &mut [SelectionValue]) -> bool {
                for v in values {
                    if v.state & (state::COMPATIBLE | state::INCLUDED) != 0 {
                        v.state = state::SELECTED;
                        return true;
                    }
                    if select_first(&mut v.children) {
                        return true;
                    }
                }
                false
            }
            select_first(&mut list.values);
        }
    }
}

/// Copy child SELECTED state upward so a selected leaf keeps its whole
/// branch visible.
fn propagate_selected(node: &mut SelectionValue) -> bool {
    let mut any = node.is_selected();
    for child in &mut node.children {
        if propagate_selected(child) {
            any = true;
        }
    }
    if any && !node.is_selected() {
        node.state = state::SELECTED;
    }
    any
}
