//! Cache-friendly column normalization.
//!
//! Structurally equal queries that differ only in column order or in
//! cosmetic aliases would fingerprint apart and generate different
//! statement text. Normalization sorts the statement's select list by
//! name and strips aliases off pure pass-through detail views; the
//! residual chain restores the caller's requested order and headers at
//! the end, so the optimization is invisible to the caller.
//!
//! The optimization is refused outright for shapes where reordering
//! is unsafe or unverifiable:
//! - distinct with no sort (source-level DISTINCT plus a reorder would
//!   change which duplicates survive)
//! - rotated or raw-embedded nodes
//! - expressions using positional `field[row][col]` addressing
//! - expressions past the length guard (deep parse recursion)
//! - snapshot-export requests
//!
//! An alias is kept whenever any expression references it as
//! `field['alias']` / `field["alias"]`, or when the node aggregates.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::LimitSettings;
use crate::model::{
    AssemblyKind, ColumnRef, ColumnSelection, DataType, ExecMode, TableAssembly,
};
use crate::sql::{SelectItem, SqlResult, Statement};

/// Positional row/column addressing in an expression body.
static POSITIONAL_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"field\s*\[\s*\d+\s*\]\s*\[").expect("positional pattern"));

/// The reorder/strip decision for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalization {
    /// Statement select list in normalized (name-sorted) order.
    pub items: Vec<SelectItem>,
    /// Statement output names in the caller's requested order; the
    /// restore projection selects these.
    pub project_names: Vec<String>,
    /// Headers the caller asked for, in requested order. Differs from
    /// `project_names` only when aliases were stripped.
    pub requested_names: Vec<String>,
    pub stripped_aliases: bool,
}

impl Normalization {
    /// Install the normalized select list on the statement. A merged
    /// ORDER BY addressing a stripped alias is rewritten to the
    /// surviving column name.
    pub fn apply(&self, stmt: &mut Statement) -> SqlResult<()> {
        stmt.set_select(self.items.clone())?;
        if self.stripped_aliases && !stmt.order_by.is_empty() {
            let keys = stmt
                .order_by
                .iter()
                .map(|k| {
                    match self.requested_names.iter().position(|n| n == &k.column) {
                        Some(i) => crate::model::SortKey {
                            column: self.project_names[i].clone(),
                            ascending: k.ascending,
                        },
                        None => k.clone(),
                    }
                })
                .collect();
            stmt.set_order_by(keys)?;
        }
        Ok(())
    }
}

/// Decide the normalization for an assembly, or `None` when the shape
/// is ineligible.
pub fn normalize_columns(
    assembly: &TableAssembly,
    mode: ExecMode,
    limits: &LimitSettings,
) -> Option<Normalization> {
    if !assembly.aggregate.is_empty() {
        return None;
    }
    if assembly.distinct && assembly.sort.is_empty() {
        return None;
    }
    if matches!(assembly.kind, AssemblyKind::Rotated | AssemblyKind::Embedded) {
        return None;
    }
    if mode == ExecMode::Snapshot {
        return None;
    }
    for col in assembly.selection.iter() {
        if let Some(body) = &col.expression {
            if POSITIONAL_REF_RE.is_match(body) {
                return None;
            }
            if body.len() > limits.formula_length_guard {
                return None;
            }
        }
    }

    // Expression columns never reach the statement, so their aliases
    // stay put; stripping one would rename the locally-computed column
    // out from under the restore projection.
    let strippable: Vec<bool> = assembly
        .selection
        .iter()
        .map(|col| {
            col.kind != crate::model::RefKind::Expression
                && col.alias.is_some()
                && alias_strippable(col, &assembly.selection)
        })
        .collect();
    let stripped_aliases = strippable.iter().any(|&s| s);

    // Effective statement-output name per column, post-strip.
    let effective: Vec<String> = assembly
        .selection
        .iter()
        .zip(&strippable)
        .map(|(col, &strip)| {
            if strip {
                col.attribute.clone()
            } else {
                col.output_name().to_string()
            }
        })
        .collect();

    let mut order: Vec<usize> = (0..assembly.selection.len()).collect();
    order.sort_by(|&a, &b| effective[a].cmp(&effective[b]));

    // Expression columns never reach the statement select list; they
    // are appended locally and restored into place by the trailing
    // projection, which addresses columns by name.
    let items: Vec<SelectItem> = order
        .iter()
        .filter(|&&i| assembly.selection.columns[i].kind != crate::model::RefKind::Expression)
        .map(|&i| {
            let col = &assembly.selection.columns[i];
            SelectItem {
                name: col.attribute.clone(),
                entity: None,
                alias: if strippable[i] { None } else { col.alias.clone() },
                expression: None,
            }
        })
        .collect();

    Some(Normalization {
        items,
        project_names: effective.clone(),
        requested_names: assembly.selection.output_names(),
        stripped_aliases,
    })
}

/// An alias can be stripped unless some expression in the selection
/// addresses it by name, in either quote style.
fn alias_strippable(col: &ColumnRef, selection: &ColumnSelection) -> bool {
    let Some(alias) = &col.alias else {
        return false;
    };
    let pattern = format!(
        r#"field\s*\[\s*(?:'{0}'|"{0}")\s*\]"#,
        regex::escape(alias)
    );
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return false,
    };
    !selection.iter().any(|other| {
        other
            .expression
            .as_ref()
            .is_some_and(|body| re.is_match(body))
    })
}

/// Rebuild a rotated assembly's column selection against the
/// post-rotation header row. Rotation turns values into headers, so
/// the stored selection no longer matches; the fixed selection takes
/// the rotated lens's headers verbatim, capped.
pub fn fix_rotated_selection(
    original: &ColumnSelection,
    rotated_headers: &[String],
    max_columns: usize,
) -> ColumnSelection {
    let columns = rotated_headers
        .iter()
        .take(max_columns)
        .map(|header| {
            let data_type = original
                .iter()
                .find(|c| c.output_name() == header)
                .map(|c| c.data_type)
                .unwrap_or(DataType::String);
            ColumnRef::new(None, header, data_type)
        })
        .collect();
    ColumnSelection::new(columns)
}
