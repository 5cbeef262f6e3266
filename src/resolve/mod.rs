//! Column identity resolution.
//!
//! Maps a logical column reference onto the column selection that
//! defines it, across renames, expressions and nested scopes. Every
//! planner phase funnels name questions through here so the precedence
//! rules live in exactly one place.
//!
//! Resolution precedence, first match wins:
//! 1. exact alias match
//! 2. unqualified attribute match on a column with no alias
//! 3. fully-qualified entity + attribute match
//! 4. attribute match ignoring the table qualifier
//! 5. case-insensitive alias match
//! 6. case-insensitive attribute match
//! 7. case-insensitive match ignoring a synthetic `OUTER` qualifier
//!    prefix (nested worksheet scopes)
//!
//! A reference never resolves to itself: an expression looking up a name
//! must land on a different underlying column. A failed resolution is
//! `None`, which callers treat as "cannot push this column down", not as
//! an error.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{ColumnRef, ColumnSelection, RefKind};

/// Matches `field['name']` / `field["name"]` references in expression
/// bodies.
pub static FIELD_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"field\s*\[\s*['"]([^'"\]]+)['"]\s*\]"#).expect("field reference pattern")
});

const OUTER_PREFIX: &str = "OUTER.";

/// Resolver bound to one generation of an assembly's selection.
///
/// Memo tables assume the selection is stable; call [`invalidate`]
/// (or drop the resolver) whenever the owning assembly is re-resolved.
///
/// [`invalidate`]: ColumnResolver::invalidate
#[derive(Debug, Default)]
pub struct ColumnResolver {
    /// Expression body -> contained plain attribute names.
    expr_memo: HashMap<String, Vec<String>>,
    /// (attribute, entity) -> resolved column index.
    attr_memo: HashMap<(String, Option<String>), Option<usize>>,
}

impl ColumnResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all memoized state.
    pub fn invalidate(&mut self) {
        self.expr_memo.clear();
        self.attr_memo.clear();
    }

    /// Resolve a reference against a selection.
    pub fn resolve<'a>(
        &mut self,
        selection: &'a ColumnSelection,
        target: &ColumnRef,
    ) -> Option<&'a ColumnRef> {
        self.resolve_index(selection, target)
            .map(|i| &selection.columns[i])
    }

    /// Resolve to a column index within the selection.
    pub fn resolve_index(
        &mut self,
        selection: &ColumnSelection,
        target: &ColumnRef,
    ) -> Option<usize> {
        let memo_key = (target.attribute.clone(), target.entity.clone());
        if let Some(hit) = self.attr_memo.get(&memo_key) {
            return *hit;
        }
        let found = Self::resolve_uncached(selection, target);
        self.attr_memo.insert(memo_key, found);
        found
    }

    /// Resolve a bare output name (as used by conditions and sorts).
    pub fn resolve_name(&mut self, selection: &ColumnSelection, name: &str) -> Option<usize> {
        let target = parse_reference(name);
        self.resolve_index(selection, &target)
    }

    fn resolve_uncached(selection: &ColumnSelection, target: &ColumnRef) -> Option<usize> {
        let name = &target.attribute;

        let candidates = || {
            selection
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.same_column(target))
        };

        // 1. exact alias match
        if let Some((i, _)) = candidates().find(|(_, c)| c.alias.as_deref() == Some(name)) {
            return Some(i);
        }
        // 2. unqualified attribute match on an alias-free column
        if target.entity.is_none() {
            if let Some((i, _)) =
                candidates().find(|(_, c)| c.alias.is_none() && c.attribute == *name)
            {
                return Some(i);
            }
        }
        // 3. fully-qualified match
        if target.entity.is_some() {
            if let Some((i, _)) = candidates()
                .find(|(_, c)| c.entity == target.entity && c.attribute == *name)
            {
                return Some(i);
            }
        }
        // 4. attribute match ignoring qualifier
        if let Some((i, _)) = candidates().find(|(_, c)| c.attribute == *name) {
            return Some(i);
        }
        // 5. case-insensitive alias match
        if let Some((i, _)) = candidates().find(|(_, c)| {
            c.alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(name))
        }) {
            return Some(i);
        }
        // 6. case-insensitive attribute match
        if let Some((i, _)) = candidates().find(|(_, c)| c.attribute.eq_ignore_ascii_case(name)) {
            return Some(i);
        }
        // 7. case-insensitive match with the OUTER scope prefix stripped
        let stripped = strip_outer(name);
        if let Some((i, _)) = candidates().find(|(_, c)| {
            c.attribute.eq_ignore_ascii_case(stripped)
                || strip_outer(&c.attribute).eq_ignore_ascii_case(stripped)
                || c.alias
                    .as_deref()
                    .is_some_and(|a| strip_outer(a).eq_ignore_ascii_case(stripped))
        }) {
            return Some(i);
        }

        None
    }

    /// Expand an expression body into the plain attribute names it
    /// transitively depends on. Expression columns referenced by name
    /// are expanded recursively; cycles terminate at the visited set.
    pub fn expand_expression(
        &mut self,
        selection: &ColumnSelection,
        body: &str,
    ) -> Vec<String> {
        if let Some(hit) = self.expr_memo.get(body) {
            return hit.clone();
        }
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.expand_inner(selection, body, &mut visited, &mut out);
        self.expr_memo.insert(body.to_string(), out.clone());
        out
    }

    fn expand_inner(
        &mut self,
        selection: &ColumnSelection,
        body: &str,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !visited.insert(body.to_string()) {
            return;
        }
        for name in referenced_fields(body) {
            let target = parse_reference(&name);
            match self.resolve_index(selection, &target) {
                Some(i) => {
                    let col = &selection.columns[i];
                    if col.kind == RefKind::Expression {
                        if let Some(inner) = col.expression.clone() {
                            self.expand_inner(selection, &inner, visited, out);
                        }
                    } else if !out.contains(&col.attribute) {
                        out.push(col.attribute.clone());
                    }
                }
                None => {
                    // Unresolvable reference: surface the raw name so the
                    // caller can reject the expression's dependency set.
                    if !out.contains(&name) {
                        out.push(name);
                    }
                }
            }
        }
    }

    /// Whether every field reference in the expression resolves within
    /// the selection.
    pub fn expression_resolvable(
        &mut self,
        selection: &ColumnSelection,
        body: &str,
    ) -> bool {
        referenced_fields(body).iter().all(|name| {
            let target = parse_reference(name);
            self.resolve_index(selection, &target).is_some()
        })
    }
}

/// Field names referenced by an expression body, in order, deduplicated.
pub fn referenced_fields(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    for cap in FIELD_REF_RE.captures_iter(body) {
        let name = cap[1].to_string();
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Parse `entity.attribute` or a bare name into a reference.
fn parse_reference(name: &str) -> ColumnRef {
    match name.split_once('.') {
        // The OUTER prefix is a scope marker, not an entity.
        Some((entity, attr)) if !entity.eq_ignore_ascii_case("OUTER") => ColumnRef::new(
            Some(entity),
            attr,
            crate::model::DataType::String,
        ),
        _ => ColumnRef::new(None, name, crate::model::DataType::String),
    }
}

fn strip_outer(name: &str) -> &str {
    match name.get(..OUTER_PREFIX.len()) {
        Some(prefix)
            if name.len() > OUTER_PREFIX.len()
                && prefix.eq_ignore_ascii_case(OUTER_PREFIX) =>
        {
            &name[OUTER_PREFIX.len()..]
        }
        _ => name,
    }
}
