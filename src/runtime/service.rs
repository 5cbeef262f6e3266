//! The top-level table service.
//!
//! `get_table_lens` is the whole pipeline in one call: fingerprint,
//! cache probe, merge planning, statement execution, the residual
//! operator chain, and the cache write-back. `get_query_plan` exposes
//! the push-down diagnostics, and `clear_cache` invalidates everything
//! recorded for an assembly.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cache::{DataKey, TableCache};
use crate::config::Settings;
use crate::lens::{
    self, BoxLens, CollapseTree, ColumnMapLens, CrossTabFilterLens, DistinctLens, FilterLens,
    FormulaLens, LensCaps, MaxRowsLens, MemoryLens, RelabelLens, RotateLens, SetOp, SetOpLens,
    SortLens, SummaryLens, TableData, TableLens,
};
use crate::model::{AggregateSpec, ConcatOp, DataType, SourceInfo, TableAssembly, Value};
use crate::planner::{
    fix_rotated_selection, MergePlanner, PlanContext, PostOp, QueryPlan, SubQueryExecutor,
};
use crate::sql::Statement;

use super::context::ExecutionContext;
use super::sandbox::{Sandbox, SandboxView};
use super::{RuntimeError, RuntimeResult};

/// Executes frozen statements (and connector/cube scans) against the
/// underlying data source.
pub trait DataSource: Send + Sync {
    fn execute(&self, stmt: &Statement, ctx: &ExecutionContext) -> RuntimeResult<BoxLens>;

    /// Tabular connector: the source runs its own opaque query.
    fn tabular(
        &self,
        source: &str,
        query_id: &str,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens>;

    /// Cube scan, optionally with aggregation the cube driver accepted.
    fn cube_scan(
        &self,
        source: &str,
        cube: &str,
        aggregate: Option<&AggregateSpec>,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens>;
}

/// Row/column security rewriter. Applied at most once per statement;
/// the `vpm_applied` flag on the statement enforces that.
pub trait VpmProcessor: Send + Sync {
    fn rewrite(&self, stmt: &mut Statement, ctx: &ExecutionContext) -> RuntimeResult<()>;
}

/// Resolves data-source prefixes. Missing sources surface as
/// user-facing errors before any execution is attempted.
pub trait Repository: Send + Sync {
    fn has_source(&self, prefix: &str) -> bool;
}

/// The service tying sandbox, planner, source and cache together.
pub struct TableService {
    sandbox: Arc<Sandbox>,
    cache: Arc<TableCache>,
    source: Arc<dyn DataSource>,
    vpm: Option<Arc<dyn VpmProcessor>>,
    repository: Option<Arc<dyn Repository>>,
    settings: Settings,
    /// Runtime-injected datasets for `AssemblyKind::Data`.
    data_tables: DashMap<String, Arc<TableData>>,
    /// Keys stored per assembly, for targeted invalidation.
    stored_keys: DashMap<String, Vec<(String, DataKey)>>,
}

impl TableService {
    pub fn new(
        sandbox: Arc<Sandbox>,
        cache: Arc<TableCache>,
        source: Arc<dyn DataSource>,
        settings: Settings,
    ) -> Self {
        Self {
            sandbox,
            cache,
            source,
            vpm: None,
            repository: None,
            settings,
            data_tables: DashMap::new(),
            stored_keys: DashMap::new(),
        }
    }

    pub fn with_vpm(mut self, vpm: Arc<dyn VpmProcessor>) -> Self {
        self.vpm = Some(vpm);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        &self.cache
    }

    /// Inject a runtime dataset behind an `AssemblyKind::Data` node.
    pub fn set_data(&self, assembly: &str, data: Arc<TableData>) {
        self.data_tables.insert(assembly.to_string(), data);
    }

    /// Build (or fetch from cache) the lens for an assembly.
    pub fn get_table_lens(
        &self,
        name: &str,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens> {
        if ctx.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        // The read lock is held through the whole build, not just the
        // fingerprint; the guard drops on every exit path.
        let view = self.sandbox.view();
        let assembly = view
            .assembly(name)
            .ok_or_else(|| RuntimeError::UnknownAssembly(name.to_string()))?;
        self.check_source(&assembly)?;

        let key = self.fingerprint(&assembly, ctx);
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(&ctx.org, key) {
                debug!(assembly = name, "table cache hit");
                return Ok(Box::new(MemoryLens::new(hit)));
            }
        }

        let plan = self.plan_assembly(&assembly, ctx, &view, key.is_some())?;
        let mut lens = self.execute_plan(&assembly, &plan, ctx, &view)?;

        if ctx.is_cancelled() {
            lens.dispose();
            return Err(RuntimeError::Cancelled);
        }

        match key {
            Some(key) => {
                let cap = self.effective_row_cap(ctx);
                let (data, truncated) = lens::materialize(lens.as_mut(), cap);
                lens.dispose();
                if truncated {
                    ctx.push_notice(format!(
                        "result truncated to {} rows for '{}'",
                        cap, name
                    ));
                }
                let data = Arc::new(data);
                self.cache.put(&ctx.org, &key, Arc::clone(&data));
                self.stored_keys
                    .entry(name.to_string())
                    .or_default()
                    .push((ctx.org.clone(), key));
                Ok(Box::new(MemoryLens::new(data)))
            }
            None => Ok(lens),
        }
    }

    /// Push-down diagnostics for an assembly.
    pub fn get_query_plan(
        &self,
        name: &str,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<String> {
        let view = self.sandbox.view();
        let assembly = view
            .assembly(name)
            .ok_or_else(|| RuntimeError::UnknownAssembly(name.to_string()))?;
        let key = self.fingerprint(&assembly, ctx);
        let plan = self.plan_assembly(&assembly, ctx, &view, key.is_some())?;
        Ok(plan.describe())
    }

    /// Drop every cached result recorded for an assembly.
    pub fn clear_cache(&self, name: &str) {
        if let Some((_, keys)) = self.stored_keys.remove(name) {
            for (org, key) in keys {
                self.cache.invalidate(&org, &key);
            }
        }
    }

    /// The fingerprint used for cache addressing, when one exists.
    pub fn fingerprint(
        &self,
        assembly: &TableAssembly,
        ctx: &ExecutionContext,
    ) -> Option<DataKey> {
        if ctx.mv_snapshot {
            // Snapshot builds feed the materialized-view store, not
            // the result cache.
            return None;
        }
        DataKey::compute(
            assembly,
            &ctx.variables,
            &ctx.user,
            ctx.mode,
            ctx.formatted,
            ctx.input_max,
            ctx.preview_max,
            ctx.ignore_filtering,
        )
    }

    fn check_source(&self, assembly: &TableAssembly) -> RuntimeResult<()> {
        let prefix = match &assembly.source {
            SourceInfo::Table { source, .. }
            | SourceInfo::Sql { source, .. }
            | SourceInfo::Tabular { source, .. }
            | SourceInfo::Cube { source, .. } => Some(source.as_str()),
            _ => None,
        };
        if let (Some(prefix), Some(repo)) = (prefix, &self.repository) {
            if !repo.has_source(prefix) {
                return Err(RuntimeError::SourceNotFound(prefix.to_string()));
            }
        }
        Ok(())
    }

    fn plan_assembly(
        &self,
        assembly: &TableAssembly,
        ctx: &ExecutionContext,
        view: &SandboxView<'_>,
        cacheable: bool,
    ) -> RuntimeResult<QueryPlan> {
        let runner = SubQueryRunner {
            service: self,
            ctx,
            view,
        };
        let planner = MergePlanner::new(view, &runner, &self.settings);
        let plan_ctx = PlanContext {
            mode: ctx.mode,
            cacheable,
        };
        Ok(planner.plan(assembly, &plan_ctx)?)
    }

    /// Fetch the base rows for a plan and run its residual chain.
    fn execute_plan(
        &self,
        assembly: &TableAssembly,
        plan: &QueryPlan,
        ctx: &ExecutionContext,
        view: &SandboxView<'_>,
    ) -> RuntimeResult<BoxLens> {
        let base = self.base_lens(assembly, plan, ctx, view)?;
        self.apply_post_ops(base, assembly, plan, ctx)
    }

    fn base_lens(
        &self,
        assembly: &TableAssembly,
        plan: &QueryPlan,
        ctx: &ExecutionContext,
        view: &SandboxView<'_>,
    ) -> RuntimeResult<BoxLens> {
        match (&plan.statement, &assembly.source) {
            (Some(stmt), _) => {
                let mut stmt = stmt.clone();
                if ctx.vpm_enabled {
                    if let Some(vpm) = &self.vpm {
                        if !stmt.vpm_applied {
                            vpm.rewrite(&mut stmt, ctx)?;
                            // The processor must flag the statement;
                            // enforce it so a second pass cannot
                            // re-apply the policies.
                            stmt.vpm_applied = true;
                        }
                    }
                }
                stmt.freeze();
                self.source.execute(&stmt, ctx)
            }
            (None, SourceInfo::Tabular { source, query_id }) => {
                self.source.tabular(source, query_id, ctx)
            }
            (None, SourceInfo::Embedded(data)) => {
                let table = TableData::new(data.headers.clone(), data.rows.clone());
                Ok(Box::new(MemoryLens::new(Arc::new(table))))
            }
            (None, SourceInfo::Runtime) => match self.data_tables.get(&assembly.name) {
                Some(data) => Ok(Box::new(MemoryLens::new(Arc::clone(&data)))),
                None => Err(RuntimeError::Source(format!(
                    "no runtime data registered for '{}'",
                    assembly.name
                ))),
            },
            (None, SourceInfo::Mirror { base }) | (None, SourceInfo::Child { base }) => {
                self.build_child(base, ctx, view)
            }
            (None, SourceInfo::Concat { children, op }) => {
                let mut iter = children.iter();
                let first = iter
                    .next()
                    .ok_or_else(|| RuntimeError::Source("empty concatenation".into()))?;
                let mut lens = self.build_child(first, ctx, view)?;
                for child in iter {
                    let right = self.build_child(child, ctx, view)?;
                    let set_op = match op {
                        ConcatOp::Union => SetOp::Union { distinct: true },
                        ConcatOp::UnionAll => SetOp::Union { distinct: false },
                        ConcatOp::Intersect => SetOp::Intersect,
                        ConcatOp::Minus => SetOp::Minus,
                    };
                    lens = Box::new(SetOpLens::new(lens, right, set_op));
                }
                Ok(lens)
            }
            (None, SourceInfo::Cube { source, cube, .. }) => {
                self.source
                    .cube_scan(source, cube, plan.cube_aggregate.as_ref(), ctx)
            }
            (None, other) => Err(RuntimeError::Source(format!(
                "assembly '{}' has no executable source ({:?})",
                assembly.name, other
            ))),
        }
    }

    fn build_child(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        view: &SandboxView<'_>,
    ) -> RuntimeResult<BoxLens> {
        let child = view
            .assembly(name)
            .ok_or_else(|| RuntimeError::UnknownAssembly(name.to_string()))?;
        self.check_source(&child)?;
        let key = self.fingerprint(&child, ctx);
        let plan = self.plan_assembly(&child, ctx, view, key.is_some())?;
        self.execute_plan(&child, &plan, ctx, view)
    }

    /// Fold the residual operator chain over the base lens.
    fn apply_post_ops(
        &self,
        mut lens: BoxLens,
        assembly: &TableAssembly,
        plan: &QueryPlan,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens> {
        for op in &plan.post_ops {
            lens = self.apply_post_op(lens, op, assembly, plan, ctx)?;
        }
        Ok(lens)
    }

    fn apply_post_op(
        &self,
        mut lens: BoxLens,
        op: &PostOp,
        assembly: &TableAssembly,
        plan: &QueryPlan,
        _ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens> {
        let headers = lens::header_names(lens.as_mut());
        let index_of = |name: &str| headers.iter().position(|h| h == name);

        Ok(match op {
            PostOp::Formula(formulas) => {
                // Per lens column, the defining selection entry. Headers
                // may show either the output name or, after alias
                // stripping, the bare attribute.
                let cols: Vec<_> = headers
                    .iter()
                    .map(|h| {
                        assembly
                            .selection
                            .iter()
                            .find(|c| c.output_name() == *h || c.attribute == *h)
                    })
                    .collect();
                // Column types feed the pure-alias fast path.
                let types: Vec<Option<DataType>> =
                    cols.iter().map(|c| c.map(|c| c.data_type)).collect();
                // Bodies address columns by output name or attribute;
                // expose whichever one the header does not already show.
                let alts: Vec<Option<String>> = cols
                    .iter()
                    .zip(&headers)
                    .map(|(c, h)| {
                        c.and_then(|c| {
                            if c.attribute != *h {
                                Some(c.attribute.clone())
                            } else if c.output_name() != *h {
                                Some(c.output_name().to_string())
                            } else {
                                None
                            }
                        })
                    })
                    .collect();
                Box::new(FormulaLens::new(lens, formulas.clone(), &types).with_alt_names(alts))
            }
            PostOp::Filter(tree) => Box::new(FilterLens::new(lens, Some(tree.clone()))),
            PostOp::Summary(spec) => {
                let group_cols: Vec<usize> =
                    spec.groups.iter().filter_map(|g| index_of(g)).collect();
                let aggregates: Vec<(usize, _, String)> = spec
                    .aggregates
                    .iter()
                    .filter_map(|a| {
                        index_of(&a.column).map(|i| (i, a.formula, a.output_name()))
                    })
                    .collect();
                let summary: BoxLens = Box::new(SummaryLens::new(lens, group_cols, aggregates));
                if plan.crosstab {
                    mark_crosstab(summary)
                } else {
                    summary
                }
            }
            PostOp::Ranking(r) => match index_of(&r.column) {
                Some(col) => {
                    let sorted = SortLens::new(lens, vec![(col, !r.top)]);
                    Box::new(MaxRowsLens::new(Box::new(sorted), r.n))
                }
                None => {
                    warn!(column = %r.column, "ranking column missing; skipping ranking");
                    lens
                }
            },
            PostOp::Distinct => Box::new(DistinctLens::new(lens, None)),
            PostOp::Sort(keys) => {
                let resolved: Vec<(usize, bool)> = keys
                    .iter()
                    .filter_map(|k| index_of(&k.column).map(|i| (i, k.ascending)))
                    .collect();
                Box::new(SortLens::new(lens, resolved))
            }
            PostOp::Rotate => {
                let mut rotated: BoxLens = Box::new(RotateLens::new(lens));
                if plan.rotate_fixup {
                    // The fixed selection is computed against the
                    // post-rotation header row, capped.
                    let cap = self.settings.limits.rotation_fixup_columns;
                    let rotated_headers = lens::header_names(rotated.as_mut());
                    let fixed =
                        fix_rotated_selection(&assembly.selection, &rotated_headers, cap);
                    if fixed.len() < rotated_headers.len() {
                        let mapping: Vec<usize> = (0..fixed.len()).collect();
                        rotated = Box::new(ColumnMapLens::new(rotated, mapping));
                    }
                }
                rotated
            }
            PostOp::Project(names) => {
                let mapping: Vec<usize> =
                    names.iter().filter_map(|n| index_of(n)).collect();
                Box::new(ColumnMapLens::new(lens, mapping))
            }
            PostOp::Relabel(names) => Box::new(RelabelLens::new(lens, names.clone())),
            PostOp::MaxRows(n) => Box::new(MaxRowsLens::new(lens, *n)),
        })
    }

    /// Apply a collapse tree to a cross-tab lens (widget interaction).
    pub fn collapse_crosstab(
        &self,
        lens: BoxLens,
        group_cols: Vec<usize>,
        tree: CollapseTree,
    ) -> BoxLens {
        Box::new(CrossTabFilterLens::new(lens, group_cols, tree))
    }

    fn effective_row_cap(&self, ctx: &ExecutionContext) -> usize {
        [ctx.preview_max, ctx.input_max, self.settings.limits.max_rows]
            .into_iter()
            .filter(|&n| n > 0)
            .min()
            .unwrap_or(0)
    }
}

/// Mark a lens as cross-tab shaped. Downstream sorts consult this
/// capability to pin header rows and recompute spans.
fn mark_crosstab(lens: BoxLens) -> BoxLens {
    struct CrosstabCaps {
        base: BoxLens,
    }
    impl TableLens for CrosstabCaps {
        fn more_rows(&mut self, row: usize) -> bool {
            self.base.more_rows(row)
        }
        fn row_count(&self) -> usize {
            self.base.row_count()
        }
        fn col_count(&self) -> usize {
            self.base.col_count()
        }
        fn cell(&self, row: usize, col: usize) -> Value {
            self.base.cell(row, col)
        }
        fn caps(&self) -> LensCaps {
            LensCaps {
                header_rows: 1,
                crosstab: true,
            }
        }
        fn dispose(&mut self) {
            self.base.dispose();
        }
    }
    Box::new(CrosstabCaps { base: lens })
}

/// Runs nested-query assemblies for the planner: the inner table
/// executes once, distinct, and its column values become the set the
/// outer rows are tested against.
struct SubQueryRunner<'a> {
    service: &'a TableService,
    ctx: &'a ExecutionContext,
    view: &'a SandboxView<'a>,
}

impl SubQueryExecutor for SubQueryRunner<'_> {
    fn distinct_values(&self, assembly: &str, column: &str) -> Result<BTreeSet<Value>, String> {
        let mut lens = self
            .service
            .build_child(assembly, self.ctx, self.view)
            .map_err(|e| e.to_string())?;
        let col = lens::column_index(lens.as_mut(), column)
            .ok_or_else(|| format!("column '{}' not found in '{}'", column, assembly))?;
        let mut values = BTreeSet::new();
        let mut row = 1;
        while lens.more_rows(row) {
            values.insert(lens.cell(row, col));
            row += 1;
        }
        lens.dispose();
        Ok(values)
    }
}
