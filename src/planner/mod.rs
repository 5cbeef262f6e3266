//! Query merge planning.
//!
//! Per assembly kind, decides which of {column selection, aggregation,
//! conditions, sort, distinct, max-rows} can be expressed in the
//! downstream statement's clauses and which must run locally against
//! the fetched rows. Merging proceeds in dependency order (FROM,
//! columns, predicate, grouping, ordering, row limit) and any step
//! may fail soft: the phase stays where it was and the remaining work
//! becomes a chain of post-processing operators.
//!
//! The planner never mutates the assembly it plans. It produces an
//! immutable `QueryPlan` value; the stored definition stays pristine.

mod normalize;

pub use normalize::{fix_rotated_selection, normalize_columns, Normalization};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::model::{
    AggregateFormula, AggregateSpec, AssemblyKind, ColumnSelection, ConditionNode, ExecMode,
    Operand, RankingSpec, RefKind, SortKey, SourceInfo, TableAssembly, Value,
};
use crate::resolve::ColumnResolver;
use crate::sql::{parse_user_sql, SelectItem, Statement, StatementTable};

/// Errors that can occur during planning.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unknown assembly: {0}")]
    UnknownAssembly(String),

    #[error("invalid column selection: {0}")]
    InvalidSelection(String),

    #[error("statement assembly failed: {0}")]
    Statement(#[from] crate::sql::SqlError),
}

pub type PlanResult<T> = Result<T, PlanError>;

/// How far merging progressed. Later phases imply the earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MergePhase {
    Unmerged,
    FromMerged,
    ColumnsMerged,
    PredicateMerged,
    GroupMerged,
    SortMerged,
    Final,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergePhase::Unmerged => "UNMERGED",
            MergePhase::FromMerged => "FROM-MERGED",
            MergePhase::ColumnsMerged => "COLUMNS-MERGED",
            MergePhase::PredicateMerged => "PREDICATE-MERGED",
            MergePhase::GroupMerged => "GROUP-MERGED",
            MergePhase::SortMerged => "SORT-MERGED",
            MergePhase::Final => "FINAL",
        };
        f.write_str(s)
    }
}

/// One local post-processing step, applied in list order against the
/// rows the (possibly partial) statement returns. Columns are
/// addressed by output name; the executor resolves them against the
/// actual header row.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// Append formula columns.
    Formula(Vec<crate::lens::FormulaColumn>),
    /// Filter by a condition tree.
    Filter(ConditionNode),
    /// Group and aggregate.
    Summary(AggregateSpec),
    /// Top/bottom-N by an aggregate output.
    Ranking(RankingSpec),
    /// Row-wise duplicate elimination.
    Distinct,
    /// Multi-key sort.
    Sort(Vec<SortKey>),
    /// Rotate orientation.
    Rotate,
    /// Project to the named columns, in order.
    Project(Vec<String>),
    /// Replace the header row (restores stripped aliases).
    Relabel(Vec<String>),
    /// Truncate to N data rows.
    MaxRows(usize),
}

impl PostOp {
    fn describe(&self) -> String {
        match self {
            PostOp::Formula(fs) => format!("formula({})", fs.len()),
            PostOp::Filter(c) => format!("filter({} tests)", c.comparisons().len()),
            PostOp::Summary(spec) => format!(
                "summary({} groups, {} aggregates)",
                spec.groups.len(),
                spec.aggregates.len()
            ),
            PostOp::Ranking(r) => format!(
                "ranking({} {} {})",
                if r.top { "top" } else { "bottom" },
                r.n,
                r.column
            ),
            PostOp::Distinct => "distinct".to_string(),
            PostOp::Sort(keys) => {
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| {
                        format!("{} {}", k.column, if k.ascending { "ASC" } else { "DESC" })
                    })
                    .collect();
                format!("sort({})", keys.join(", "))
            }
            PostOp::Rotate => "rotate".to_string(),
            PostOp::Project(names) => format!("project({})", names.join(", ")),
            PostOp::Relabel(_) => "relabel".to_string(),
            PostOp::MaxRows(n) => format!("max-rows({})", n),
        }
    }
}

/// Per-request planning inputs that are not part of the assembly.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub mode: ExecMode,
    /// Whether the request has a stable fingerprint. Cache
    /// normalization only pays off for cacheable requests.
    pub cacheable: bool,
}

impl Default for PlanContext {
    fn default() -> Self {
        Self {
            mode: ExecMode::Runtime,
            cacheable: true,
        }
    }
}

/// The immutable plan: a statement (when anything merged) plus the
/// residual operator chain.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub assembly: String,
    pub kind: AssemblyKind,
    pub statement: Option<Statement>,
    pub phase: MergePhase,
    pub post_ops: Vec<PostOp>,
    /// Aggregation handed to the cube driver, for cube sources whose
    /// flavor accepts it.
    pub cube_aggregate: Option<AggregateSpec>,
    /// The result of this plan is cross-tab shaped.
    pub crosstab: bool,
    /// Rotated assemblies with aggregation need their selection fixed
    /// against the post-rotation header row.
    pub rotate_fixup: bool,
    /// Conditions dropped because a column would not resolve or a
    /// nested query failed during setup.
    pub dropped_conditions: usize,
}

impl QueryPlan {
    /// Human-readable description of what was pushed down.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("assembly: {} ({:?})\n", self.assembly, self.kind));
        out.push_str(&format!("phase: {}\n", self.phase));
        match &self.statement {
            Some(stmt) => match stmt.sql(crate::sql::Dialect::Ansi) {
                Ok(sql) => {
                    out.push_str("statement:\n");
                    for line in sql.lines() {
                        out.push_str("  ");
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                Err(_) => out.push_str("statement: <incomplete>\n"),
            },
            None => out.push_str("statement: none\n"),
        }
        if let Some(agg) = &self.cube_aggregate {
            out.push_str(&format!(
                "cube aggregate: {} groups, {} aggregates\n",
                agg.groups.len(),
                agg.aggregates.len()
            ));
        }
        if self.post_ops.is_empty() {
            out.push_str("post: none\n");
        } else {
            let ops: Vec<String> = self.post_ops.iter().map(|op| op.describe()).collect();
            out.push_str(&format!("post: {}\n", ops.join(", ")));
        }
        if self.dropped_conditions > 0 {
            out.push_str(&format!("dropped conditions: {}\n", self.dropped_conditions));
        }
        out
    }
}

/// Lookup of sibling assemblies (for mirrors, concats and nested
/// queries).
pub trait AssemblyLookup {
    fn assembly(&self, name: &str) -> Option<TableAssembly>;
}

/// Executes a nested-query condition's inner assembly. The inner table
/// runs distinct, once per merge pass; per-row evaluation then tests
/// against the returned set.
pub trait SubQueryExecutor {
    fn distinct_values(&self, assembly: &str, column: &str) -> Result<BTreeSet<Value>, String>;
}

/// The merge planner.
pub struct MergePlanner<'a> {
    lookup: &'a dyn AssemblyLookup,
    subquery: &'a dyn SubQueryExecutor,
    settings: &'a crate::config::Settings,
}

impl<'a> MergePlanner<'a> {
    pub fn new(
        lookup: &'a dyn AssemblyLookup,
        subquery: &'a dyn SubQueryExecutor,
        settings: &'a crate::config::Settings,
    ) -> Self {
        Self {
            lookup,
            subquery,
            settings,
        }
    }

    /// Plan one assembly. The assembly is read, never mutated.
    pub fn plan(&self, assembly: &TableAssembly, ctx: &PlanContext) -> PlanResult<QueryPlan> {
        assembly
            .selection
            .validate_unique_names()
            .map_err(PlanError::InvalidSelection)?;

        match assembly.kind {
            AssemblyKind::Bound => self.plan_relational(assembly, ctx, None),
            AssemblyKind::Sql => self.plan_sql(assembly, ctx),
            AssemblyKind::Tabular => self.plan_local(assembly, ctx),
            AssemblyKind::Embedded | AssemblyKind::Data => self.plan_local(assembly, ctx),
            AssemblyKind::Mirror => self.plan_local(assembly, ctx),
            AssemblyKind::Concat => self.plan_local(assembly, ctx),
            AssemblyKind::Rotated => self.plan_rotated(assembly, ctx),
            AssemblyKind::CrossTab => self.plan_crosstab(assembly, ctx),
            AssemblyKind::Cube => self.plan_cube(assembly, ctx),
        }
    }

    // =========================================================================
    // Relational sources (bound tables, gated hand-authored SQL)
    // =========================================================================

    fn plan_relational(
        &self,
        assembly: &TableAssembly,
        ctx: &PlanContext,
        from_override: Option<StatementTable>,
    ) -> PlanResult<QueryPlan> {
        let mut plan = QueryPlan {
            assembly: assembly.name.clone(),
            kind: assembly.kind,
            statement: None,
            phase: MergePhase::Unmerged,
            post_ops: Vec::new(),
            cube_aggregate: None,
            crosstab: false,
            rotate_fixup: false,
            dropped_conditions: 0,
        };

        // FROM: a node with no mergeable source cannot merge anything
        // downstream of it.
        let table = match from_override {
            Some(t) => t,
            None => match &assembly.source {
                SourceInfo::Table {
                    table,
                    schema,
                    catalog,
                    ..
                } => StatementTable::named(table)
                    .with_schema(schema.as_deref(), catalog.as_deref()),
                _ => {
                    self.push_all_local(assembly, &mut plan);
                    return Ok(plan);
                }
            },
        };

        let mut stmt = Statement::new();
        stmt.set_source(table)?;
        plan.phase = MergePhase::FromMerged;

        // COLUMNS: expressions are script-evaluated, so the column
        // phase merges only an all-plain selection.
        let plain_only = !assembly.selection.has_expressions();
        let (select_items, normalization) = self.build_select(assembly, ctx);
        stmt.set_select(select_items)?;
        let mut columns_merged = false;
        if plain_only {
            columns_merged = true;
            plan.phase = MergePhase::ColumnsMerged;
            if assembly.distinct {
                stmt.set_distinct(true)?;
            }
        } else {
            // Formulas run locally over the plain columns the
            // statement fetches.
            let formulas = expression_formulas(&assembly.selection);
            if !formulas.is_empty() {
                plan.post_ops.push(PostOp::Formula(formulas));
            }
        }

        // PREDICATE. Merged predicates must reference source column
        // names: output aliases are not visible to a WHERE clause.
        let mut predicate_merged = false;
        let pre = self.prepare_conditions(assembly, &assembly.pre_conditions, &mut plan);
        if let Some(tree) = pre {
            let pushable = columns_merged && tree_pushable(&tree, &assembly.selection);
            if pushable {
                let mut rewritten = tree;
                rewrite_to_attributes(&mut rewritten, &assembly.selection);
                stmt.set_predicate(Some(rewritten))?;
                predicate_merged = true;
                plan.phase = MergePhase::PredicateMerged;
            } else {
                plan.post_ops.push(PostOp::Filter(tree));
            }
        } else if columns_merged {
            predicate_merged = true;
            plan.phase = MergePhase::PredicateMerged;
        }

        // GROUPING. Same renaming rule: GROUP BY addresses the source
        // column, the alias reappears on the select item.
        let mut grouped_merged = false;
        if assembly.aggregate.is_empty() {
            if predicate_merged {
                grouped_merged = true;
                plan.phase = MergePhase::GroupMerged;
            }
        } else if predicate_merged && grouping_pushable(&assembly.aggregate, &assembly.selection)
        {
            let attr = |name: &str| -> String {
                assembly
                    .selection
                    .position_of(name)
                    .map(|i| assembly.selection.columns[i].attribute.clone())
                    .unwrap_or_else(|| name.to_string())
            };
            let group_attrs: Vec<String> =
                assembly.aggregate.groups.iter().map(|g| attr(g)).collect();
            let items: Vec<SelectItem> = assembly
                .aggregate
                .groups
                .iter()
                .zip(&group_attrs)
                .map(|(g, a)| SelectItem {
                    name: a.clone(),
                    entity: None,
                    alias: if g == a { None } else { Some(g.clone()) },
                    expression: None,
                })
                .collect();
            let aggregates: Vec<crate::model::AggregateRef> = assembly
                .aggregate
                .aggregates
                .iter()
                .map(|a| crate::model::AggregateRef {
                    column: attr(&a.column),
                    formula: a.formula,
                    alias: Some(a.output_name()),
                })
                .collect();
            stmt.set_select(items)?;
            stmt.set_grouping(group_attrs, aggregates)?;
            grouped_merged = true;
            plan.phase = MergePhase::GroupMerged;
        } else {
            plan.post_ops.push(PostOp::Summary(assembly.aggregate.clone()));
        }

        // Post-aggregation conditions and ranking always run locally.
        let post = self.prepare_conditions(assembly, &assembly.post_conditions, &mut plan);
        if let Some(tree) = post {
            plan.post_ops.push(PostOp::Filter(tree));
        }
        if let Some(ranking) = &assembly.ranking {
            plan.post_ops.push(PostOp::Ranking(ranking.clone()));
        }
        if assembly.distinct && !columns_merged {
            plan.post_ops.push(PostOp::Distinct);
        }

        // ORDERING.
        if !assembly.sort.is_empty() {
            let sortable = grouped_merged
                && assembly
                    .sort
                    .keys
                    .iter()
                    .all(|k| statement_output_name(&stmt, &k.column));
            if sortable {
                stmt.set_order_by(assembly.sort.keys.clone())?;
                plan.phase = MergePhase::SortMerged;
            } else {
                plan.post_ops.push(PostOp::Sort(assembly.sort.keys.clone()));
            }
        } else if grouped_merged {
            plan.phase = MergePhase::SortMerged;
        }

        // Cache normalization reorders the statement's select list;
        // the residual chain restores the requested order at the end.
        if let Some(norm) = normalization {
            norm.apply(&mut stmt)?;
            plan.post_ops.push(PostOp::Project(norm.project_names.clone()));
            if norm.stripped_aliases {
                plan.post_ops.push(PostOp::Relabel(norm.requested_names.clone()));
            }
        }

        // Hidden columns ride along for conditions and sorts, then
        // drop out of the visible output here.
        if assembly.aggregate.is_empty() {
            let visible: Vec<String> = assembly
                .selection
                .iter()
                .filter(|c| c.visible)
                .map(|c| c.output_name().to_string())
                .collect();
            if !visible.is_empty() && visible.len() < assembly.selection.len() {
                plan.post_ops.push(PostOp::Project(visible));
            }
        }

        // FINAL: the limit is always enforced locally; the statement
        // carries it as a hint only when the residual chain preserves
        // row count and order (anything else would truncate the wrong
        // rows upstream).
        if assembly.max_rows > 0 {
            let row_preserving = plan
                .post_ops
                .iter()
                .all(|op| matches!(op, PostOp::Project(_) | PostOp::Relabel(_)));
            if plan.phase >= MergePhase::SortMerged && row_preserving {
                stmt.set_max_rows(assembly.max_rows)?;
            }
            plan.post_ops.push(PostOp::MaxRows(assembly.max_rows));
        }
        if plan.phase >= MergePhase::SortMerged {
            plan.phase = MergePhase::Final;
        }

        plan.statement = Some(stmt);
        Ok(plan)
    }

    /// Select items for the statement, plus the cache normalization to
    /// apply when the request qualifies.
    fn build_select(
        &self,
        assembly: &TableAssembly,
        ctx: &PlanContext,
    ) -> (Vec<SelectItem>, Option<Normalization>) {
        let items: Vec<SelectItem> = assembly
            .selection
            .iter()
            .filter(|c| c.kind != RefKind::Expression)
            .map(|c| SelectItem {
                name: c.attribute.clone(),
                entity: None,
                alias: c.alias.clone(),
                expression: None,
            })
            .collect();

        let normalization = if ctx.cacheable {
            normalize_columns(assembly, ctx.mode, &self.settings.limits)
        } else {
            None
        };
        (items, normalization)
    }

    // =========================================================================
    // Hand-authored SQL
    // =========================================================================

    fn plan_sql(&self, assembly: &TableAssembly, ctx: &PlanContext) -> PlanResult<QueryPlan> {
        let text = match &assembly.source {
            SourceInfo::Sql { text, .. } => text.clone(),
            _ => String::new(),
        };

        match parse_user_sql(&text) {
            Some(parsed) => {
                // Only columns the authored projection actually yields
                // can merge on top of it.
                let covered = assembly
                    .selection
                    .iter()
                    .filter(|c| c.kind != RefKind::Expression)
                    .all(|c| parsed.projection.iter().any(|p| p == &c.attribute));
                if covered {
                    let table = StatementTable::derived(&text, "t0");
                    return self.plan_relational(assembly, ctx, Some(table));
                }
                self.plan_raw_passthrough(assembly, text)
            }
            None => self.plan_raw_passthrough(assembly, text),
        }
    }

    /// Non-mergeable authored SQL: run it verbatim, do everything
    /// locally.
    fn plan_raw_passthrough(
        &self,
        assembly: &TableAssembly,
        text: String,
    ) -> PlanResult<QueryPlan> {
        let mut plan = QueryPlan {
            assembly: assembly.name.clone(),
            kind: assembly.kind,
            statement: None,
            phase: MergePhase::Unmerged,
            post_ops: Vec::new(),
            cube_aggregate: None,
            crosstab: false,
            rotate_fixup: false,
            dropped_conditions: 0,
        };
        let mut stmt = Statement::new();
        stmt.set_source(StatementTable::derived(&text, "t0"))?;
        plan.statement = Some(stmt);
        self.push_all_local(assembly, &mut plan);
        Ok(plan)
    }

    // =========================================================================
    // Locally evaluated kinds
    // =========================================================================

    fn plan_local(&self, assembly: &TableAssembly, _ctx: &PlanContext) -> PlanResult<QueryPlan> {
        let mut plan = QueryPlan {
            assembly: assembly.name.clone(),
            kind: assembly.kind,
            statement: None,
            phase: MergePhase::Unmerged,
            post_ops: Vec::new(),
            cube_aggregate: None,
            crosstab: false,
            rotate_fixup: false,
            dropped_conditions: 0,
        };
        self.push_all_local(assembly, &mut plan);
        Ok(plan)
    }

    fn plan_rotated(&self, assembly: &TableAssembly, _ctx: &PlanContext) -> PlanResult<QueryPlan> {
        let mut plan = QueryPlan {
            assembly: assembly.name.clone(),
            kind: assembly.kind,
            statement: None,
            phase: MergePhase::Unmerged,
            post_ops: vec![PostOp::Rotate],
            cube_aggregate: None,
            crosstab: false,
            rotate_fixup: !assembly.aggregate.is_empty(),
            dropped_conditions: 0,
        };
        self.push_all_local(assembly, &mut plan);
        Ok(plan)
    }

    fn plan_crosstab(&self, assembly: &TableAssembly, _ctx: &PlanContext) -> PlanResult<QueryPlan> {
        let mut plan = QueryPlan {
            assembly: assembly.name.clone(),
            kind: assembly.kind,
            statement: None,
            phase: MergePhase::Unmerged,
            post_ops: Vec::new(),
            cube_aggregate: None,
            crosstab: true,
            rotate_fixup: false,
            dropped_conditions: 0,
        };
        self.push_all_local(assembly, &mut plan);
        Ok(plan)
    }

    fn plan_cube(&self, assembly: &TableAssembly, _ctx: &PlanContext) -> PlanResult<QueryPlan> {
        let mut plan = QueryPlan {
            assembly: assembly.name.clone(),
            kind: assembly.kind,
            statement: None,
            phase: MergePhase::Unmerged,
            post_ops: Vec::new(),
            cube_aggregate: None,
            crosstab: false,
            rotate_fixup: false,
            dropped_conditions: 0,
        };

        let cube_type = match &assembly.source {
            SourceInfo::Cube { cube_type, .. } => *cube_type,
            _ => crate::model::CubeType::Other,
        };
        let merged = !assembly.aggregate.is_empty()
            && cube_type.supports_merged_aggregate()
            && cube_aggregate_expressible(&assembly.aggregate);
        if merged {
            plan.cube_aggregate = Some(assembly.aggregate.clone());
        }

        // Predicates never merge into a cube query; everything else
        // runs locally over the raw cube rows.
        let pre = self.prepare_conditions(assembly, &assembly.pre_conditions, &mut plan);
        if let Some(tree) = pre {
            plan.post_ops.push(PostOp::Filter(tree));
        }
        if !assembly.aggregate.is_empty() && !merged {
            plan.post_ops.push(PostOp::Summary(assembly.aggregate.clone()));
        }
        let post = self.prepare_conditions(assembly, &assembly.post_conditions, &mut plan);
        if let Some(tree) = post {
            plan.post_ops.push(PostOp::Filter(tree));
        }
        if let Some(ranking) = &assembly.ranking {
            plan.post_ops.push(PostOp::Ranking(ranking.clone()));
        }
        if assembly.distinct {
            plan.post_ops.push(PostOp::Distinct);
        }
        if !assembly.sort.is_empty() {
            plan.post_ops.push(PostOp::Sort(assembly.sort.keys.clone()));
        }
        if assembly.max_rows > 0 {
            plan.post_ops.push(PostOp::MaxRows(assembly.max_rows));
        }
        Ok(plan)
    }

    /// Put the assembly's whole operation set on the local chain, in
    /// evaluation order.
    fn push_all_local(&self, assembly: &TableAssembly, plan: &mut QueryPlan) {
        let formulas = expression_formulas(&assembly.selection);
        if !formulas.is_empty() {
            plan.post_ops.push(PostOp::Formula(formulas));
        }
        let pre = self.prepare_conditions(assembly, &assembly.pre_conditions, plan);
        if let Some(tree) = pre {
            plan.post_ops.push(PostOp::Filter(tree));
        }
        if !assembly.aggregate.is_empty() {
            plan.post_ops.push(PostOp::Summary(assembly.aggregate.clone()));
        }
        let post = self.prepare_conditions(assembly, &assembly.post_conditions, plan);
        if let Some(tree) = post {
            plan.post_ops.push(PostOp::Filter(tree));
        }
        if let Some(ranking) = &assembly.ranking {
            plan.post_ops.push(PostOp::Ranking(ranking.clone()));
        }
        if assembly.distinct {
            plan.post_ops.push(PostOp::Distinct);
        }
        if !assembly.sort.is_empty() {
            plan.post_ops.push(PostOp::Sort(assembly.sort.keys.clone()));
        }
        // Project to the visible selection, where the selection (still)
        // describes the output: rotation invalidates it and aggregation
        // replaces it.
        if assembly.aggregate.is_empty()
            && assembly.kind != AssemblyKind::Rotated
            && !assembly.selection.is_empty()
        {
            let visible: Vec<String> = assembly
                .selection
                .iter()
                .filter(|c| c.visible)
                .map(|c| c.output_name().to_string())
                .collect();
            if !visible.is_empty() {
                plan.post_ops.push(PostOp::Project(visible));
            }
        }
        if assembly.max_rows > 0 {
            plan.post_ops.push(PostOp::MaxRows(assembly.max_rows));
        }
    }

    /// Resolve nested queries and drop what cannot be evaluated.
    ///
    /// A nested query's inner table executes distinct, once, here; its
    /// value set is then tested per outer row. A failure during that
    /// setup drops just the offending condition, logged; the plan
    /// proceeds without it.
    fn prepare_conditions(
        &self,
        assembly: &TableAssembly,
        conditions: &Option<ConditionNode>,
        plan: &mut QueryPlan,
    ) -> Option<ConditionNode> {
        let mut tree = conditions.clone()?;

        tree.map_comparisons(&mut |cmp| {
            if let Operand::SubQuery(sq) = &cmp.operand {
                if self.lookup.assembly(&sq.assembly).is_none() {
                    warn!(
                        assembly = %assembly.name,
                        inner = %sq.assembly,
                        "nested query references unknown assembly; dropping condition"
                    );
                    cmp.operand = Operand::None;
                    return;
                }
                match self.subquery.distinct_values(&sq.assembly, &sq.column) {
                    Ok(values) => {
                        cmp.operand = Operand::ValueSet(Arc::new(values));
                        cmp.op = crate::model::CompareOp::In;
                    }
                    Err(e) => {
                        warn!(
                            assembly = %assembly.name,
                            inner = %sq.assembly,
                            error = %e,
                            "nested query failed during merge; dropping condition"
                        );
                        cmp.operand = Operand::None;
                    }
                }
            }
        });

        let mut tree = Some(tree);
        let mut dropped = ConditionNode::retain_comparisons(&mut tree, &|cmp| {
            if matches!(cmp.operand, Operand::None) && cmp.op != crate::model::CompareOp::IsNull {
                return false;
            }
            true
        });
        // Unresolvable columns are dropped the same way. An empty
        // selection (mirrors, concatenations) defers the column set to
        // its children, so nothing can be validated here.
        dropped += ConditionNode::retain_comparisons(&mut tree, &|cmp| {
            let known = assembly.selection.is_empty()
                || assembly.selection.position_of(&cmp.column).is_some()
                || assembly
                    .aggregate
                    .aggregates
                    .iter()
                    .any(|a| a.output_name() == cmp.column);
            if !known {
                warn!(
                    assembly = %assembly.name,
                    column = %cmp.column,
                    "condition references unresolvable column; dropping it"
                );
            }
            known
        });

        plan.dropped_conditions += dropped;
        tree
    }
}

/// Expression columns turned into local formula steps. An expression
/// whose dependency set does not fully resolve within the selection is
/// rejected (dropped with a warning), matching the treatment of
/// unresolvable condition columns.
fn expression_formulas(selection: &ColumnSelection) -> Vec<crate::lens::FormulaColumn> {
    let mut resolver = ColumnResolver::new();
    selection
        .iter()
        .filter(|c| c.kind == RefKind::Expression)
        .filter_map(|c| {
            let body = c.expression.as_ref()?;
            if !resolver.expression_resolvable(selection, body) {
                warn!(
                    column = %c.output_name(),
                    "expression dependencies do not resolve; dropping column"
                );
                return None;
            }
            Some(crate::lens::FormulaColumn::new(
                c.output_name(),
                body,
                c.data_type,
            ))
        })
        .collect()
}

/// Rewrite condition column references from output names (aliases) to
/// the underlying source attribute names.
fn rewrite_to_attributes(tree: &mut ConditionNode, selection: &ColumnSelection) {
    tree.map_comparisons(&mut |cmp| {
        if let Some(i) = selection.position_of(&cmp.column) {
            cmp.column = selection.columns[i].attribute.clone();
        }
        if let Operand::Column(name) = &cmp.operand {
            if let Some(i) = selection.position_of(name) {
                cmp.operand = Operand::Column(selection.columns[i].attribute.clone());
            }
        }
    });
}

/// Whether every comparison targets a plain, pushable column.
fn tree_pushable(tree: &ConditionNode, selection: &ColumnSelection) -> bool {
    tree.comparisons().iter().all(|cmp| {
        if cmp.has_subquery() {
            return false;
        }
        match selection.position_of(&cmp.column) {
            Some(i) => selection.columns[i].kind != RefKind::Expression,
            None => false,
        }
    })
}

/// Grouping merges when every group and aggregate source is a plain
/// column of the selection.
fn grouping_pushable(aggregate: &AggregateSpec, selection: &ColumnSelection) -> bool {
    let plain = |name: &str| match selection.position_of(name) {
        Some(i) => selection.columns[i].kind != RefKind::Expression,
        None => false,
    };
    aggregate.groups.iter().all(|g| plain(g))
        && aggregate.aggregates.iter().all(|a| plain(&a.column))
}

/// Whether the statement exposes an output column with this name.
fn statement_output_name(stmt: &Statement, name: &str) -> bool {
    stmt.select.iter().any(|i| i.output_name() == name)
        || stmt.group_by.iter().any(|g| g == name)
        || stmt.aggregates.iter().any(|a| match &a.alias {
            Some(alias) => alias == name,
            None => false,
        })
}

/// Whether a cube flavor's native aggregation grammar can express the
/// spec: plain formulas only, no positional or windowed forms.
pub fn cube_aggregate_expressible(aggregate: &AggregateSpec) -> bool {
    aggregate.aggregates.iter().all(|a| {
        matches!(
            a.formula,
            AggregateFormula::Sum
                | AggregateFormula::Count
                | AggregateFormula::Avg
                | AggregateFormula::Min
                | AggregateFormula::Max
        )
    })
}
