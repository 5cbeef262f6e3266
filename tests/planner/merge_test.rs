//! End-to-end merge scenarios through the table service, against a
//! fake data source that honors the statement's clauses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tessera::cache::{MemoryStoreFactory, StaticCluster, StoreFactory, TableCache};
use tessera::config::Settings;
use tessera::lens::{
    self, BoxLens, ColumnMapLens, DistinctLens, FilterLens, MaxRowsLens, MemoryLens, RelabelLens,
    SortLens, SummaryLens, TableData, TableLens,
};
use tessera::model::{
    AssemblyKind, ColumnRef, ColumnSelection, CompareOp, Comparison, ConditionNode, CubeType,
    DataType, Operand, SortKey, SourceInfo, SubQueryRef, TableAssembly, Value,
};
use tessera::runtime::{DataSource, ExecutionContext, RuntimeError, RuntimeResult, Sandbox,
    TableService};
use tessera::sql::{Dialect, Statement};

// =============================================================================
// Fake data source
// =============================================================================

/// Interprets frozen statements against registered tables, honoring
/// projection, predicate, grouping, ordering, distinct and limits the
/// way a remote source would.
struct FakeSource {
    tables: HashMap<String, TableData>,
    executed: Mutex<Vec<String>>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            tables: HashMap::new(),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn with_table(mut self, name: &str, data: TableData) -> Self {
        self.tables.insert(name.to_string(), data);
        self
    }

    fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl DataSource for FakeSource {
    fn execute(&self, stmt: &Statement, _ctx: &ExecutionContext) -> RuntimeResult<BoxLens> {
        assert!(stmt.is_frozen(), "sources must only see frozen statements");
        self.executed
            .lock()
            .unwrap()
            .push(stmt.sql(Dialect::Ansi).unwrap_or_default());

        let table = stmt
            .tables
            .first()
            .ok_or_else(|| RuntimeError::Source("no source table".into()))?;
        let data = self
            .tables
            .get(&table.table)
            .cloned()
            .ok_or_else(|| RuntimeError::Source(format!("no table '{}'", table.table)))?;
        let mut out: BoxLens = Box::new(MemoryLens::new(Arc::new(data)));

        if let Some(pred) = &stmt.predicate {
            out = Box::new(FilterLens::new(out, Some(pred.clone())));
        }
        if !stmt.group_by.is_empty() {
            let headers = lens::header_names(out.as_mut());
            let idx = |name: &str| headers.iter().position(|h| h == name);
            let groups: Vec<usize> = stmt.group_by.iter().filter_map(|g| idx(g)).collect();
            let aggs: Vec<(usize, _, String)> = stmt
                .aggregates
                .iter()
                .filter_map(|a| idx(&a.column).map(|i| (i, a.formula, a.output_name())))
                .collect();
            out = Box::new(SummaryLens::new(out, groups, aggs));
        } else if !stmt.select.is_empty() {
            let headers = lens::header_names(out.as_mut());
            let mapping: Vec<usize> = stmt
                .select
                .iter()
                .filter_map(|i| headers.iter().position(|h| h == &i.name))
                .collect();
            let labels: Vec<String> = stmt
                .select
                .iter()
                .map(|i| i.output_name().to_string())
                .collect();
            out = Box::new(RelabelLens::new(
                Box::new(ColumnMapLens::new(out, mapping)),
                labels,
            ));
        }
        if stmt.distinct {
            out = Box::new(DistinctLens::new(out, None));
        }
        if !stmt.order_by.is_empty() {
            let headers = lens::header_names(out.as_mut());
            let keys: Vec<(usize, bool)> = stmt
                .order_by
                .iter()
                .filter_map(|k| {
                    headers
                        .iter()
                        .position(|h| h == &k.column)
                        .map(|i| (i, k.ascending))
                })
                .collect();
            out = Box::new(SortLens::new(out, keys));
        }
        if stmt.max_rows > 0 {
            out = Box::new(MaxRowsLens::new(out, stmt.max_rows));
        }
        Ok(out)
    }

    fn tabular(
        &self,
        _source: &str,
        query_id: &str,
        _ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens> {
        let data = self
            .tables
            .get(query_id)
            .cloned()
            .ok_or_else(|| RuntimeError::Source(format!("no connector '{}'", query_id)))?;
        Ok(Box::new(MemoryLens::new(Arc::new(data))))
    }

    fn cube_scan(
        &self,
        _source: &str,
        cube: &str,
        aggregate: Option<&tessera::model::AggregateSpec>,
        _ctx: &ExecutionContext,
    ) -> RuntimeResult<BoxLens> {
        let data = self
            .tables
            .get(cube)
            .cloned()
            .ok_or_else(|| RuntimeError::Source(format!("no cube '{}'", cube)))?;
        let mut out: BoxLens = Box::new(MemoryLens::new(Arc::new(data)));
        if let Some(spec) = aggregate {
            let headers = lens::header_names(out.as_mut());
            let idx = |name: &str| headers.iter().position(|h| h == name);
            let groups: Vec<usize> = spec.groups.iter().filter_map(|g| idx(g)).collect();
            let aggs: Vec<(usize, _, String)> = spec
                .aggregates
                .iter()
                .filter_map(|a| idx(&a.column).map(|i| (i, a.formula, a.output_name())))
                .collect();
            out = Box::new(SummaryLens::new(out, groups, aggs));
        }
        Ok(out)
    }
}

// =============================================================================
// Harness
// =============================================================================

fn orders_table() -> TableData {
    // ids 1..=20; names sort in reverse id order.
    TableData::new(
        vec!["id".into(), "name".into()],
        (1..=20)
            .map(|i| {
                vec![
                    Value::Int(i),
                    Value::Str(format!("n{:02}", 25 - i)),
                ]
            })
            .collect(),
    )
}

fn items_table() -> TableData {
    TableData::new(
        vec!["qty".into(), "price".into()],
        vec![
            vec![Value::Int(4), Value::Float(2.5)],
            vec![Value::Int(2), Value::Float(10.0)],
        ],
    )
}

fn service_with(source: FakeSource) -> (TableService, Arc<FakeSource>) {
    let source = Arc::new(source);
    let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());
    let cache = Arc::new(
        TableCache::new(
            &Settings::default().cache,
            factory,
            Arc::new(StaticCluster::new()),
        )
        .unwrap(),
    );
    let service = TableService::new(
        Arc::new(Sandbox::new()),
        cache,
        Arc::clone(&source) as Arc<dyn DataSource>,
        Settings::default(),
    );
    (service, source)
}

fn snapshot(lens: &mut dyn TableLens) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    let mut r = 0;
    while lens.more_rows(r) {
        out.push(
            (0..lens.col_count())
                .map(|c| lens.cell(r, c).to_display())
                .collect(),
        );
        r += 1;
    }
    out
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_fully_merged_bound_query() {
    let (service, source) = service_with(FakeSource::new().with_table("orders", orders_table()));
    let mut asm = TableAssembly::bound("orders_view", "db", "orders");
    asm.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "id", DataType::Integer),
        ColumnRef::new(None, "name", DataType::String),
    ]);
    asm.pre_conditions = Some(ConditionNode::leaf(Comparison::new(
        "id",
        CompareOp::Gt,
        Operand::Value(Value::Int(5)),
    )));
    asm.sort.keys.push(SortKey::asc("name"));
    asm.max_rows = 10;
    service.sandbox().put_assembly(asm).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let plan = service.get_query_plan("orders_view", &ctx).unwrap();
    assert!(plan.contains("phase: FINAL"), "plan was:\n{}", plan);

    let mut lens = service.get_table_lens("orders_view", &ctx).unwrap();
    let rows = snapshot(lens.as_mut());
    assert_eq!(rows.len(), 11, "header + at most 10 data rows");
    // Ordered by name ascending.
    let names: Vec<&String> = rows[1..].iter().map(|r| &r[1]).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    // Predicate honored: every id > 5.
    assert!(rows[1..].iter().all(|r| r[0].parse::<i64>().unwrap() > 5));

    // Predicate and sort were pushed into the generated statement.
    let sql = source.executed_sql().join("\n");
    assert!(sql.contains("WHERE"), "sql was:\n{}", sql);
    assert!(sql.contains("ORDER BY"), "sql was:\n{}", sql);
}

#[test]
fn test_expression_column_restores_requested_order() {
    let (service, _) = service_with(FakeSource::new().with_table("items", items_table()));
    let mut asm = TableAssembly::bound("items_view", "db", "items");
    asm.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "qty", DataType::Integer),
        ColumnRef::new(None, "price", DataType::Double),
        ColumnRef::expression("total", "field['price'] * field['qty']", DataType::Double),
    ]);
    service.sandbox().put_assembly(asm).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let mut lens = service.get_table_lens("items_view", &ctx).unwrap();
    let rows = snapshot(lens.as_mut());
    // The statement was normalized (price before qty), yet the output
    // matches the requested order with the computed column last.
    assert_eq!(rows[0], vec!["qty", "price", "total"]);
    assert_eq!(rows[1], vec!["4", "2.5", "10"]);
    assert_eq!(rows[2], vec!["2", "10", "20"]);
}

#[test]
fn test_subquery_condition_resolved_once() {
    let (service, _) = service_with(
        FakeSource::new()
            .with_table("orders", orders_table())
            .with_table("vip", TableData::new(
                vec!["id".into()],
                vec![vec![Value::Int(6)], vec![Value::Int(7)], vec![Value::Int(6)]],
            )),
    );
    let mut inner = TableAssembly::bound("vip_view", "db", "vip");
    inner.selection =
        ColumnSelection::new(vec![ColumnRef::new(None, "id", DataType::Integer)]);
    service.sandbox().put_assembly(inner).unwrap();

    let mut outer = TableAssembly::bound("orders_view", "db", "orders");
    outer.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "id", DataType::Integer),
        ColumnRef::new(None, "name", DataType::String),
    ]);
    outer.pre_conditions = Some(ConditionNode::leaf(Comparison::new(
        "id",
        CompareOp::In,
        Operand::SubQuery(SubQueryRef {
            assembly: "vip_view".into(),
            column: "id".into(),
        }),
    )));
    service.sandbox().put_assembly(outer).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let mut lens = service.get_table_lens("orders_view", &ctx).unwrap();
    let rows = snapshot(lens.as_mut());
    assert_eq!(rows.len(), 3); // header + ids 6 and 7
    let ids: Vec<&String> = rows[1..].iter().map(|r| &r[0]).collect();
    assert_eq!(ids, vec!["6", "7"]);
}

#[test]
fn test_failed_subquery_drops_condition_only() {
    let (service, _) = service_with(FakeSource::new().with_table("orders", orders_table()));
    let mut outer = TableAssembly::bound("orders_view", "db", "orders");
    outer.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "id", DataType::Integer),
        ColumnRef::new(None, "name", DataType::String),
    ]);
    outer.pre_conditions = Some(ConditionNode::and(vec![
        ConditionNode::leaf(Comparison::new(
            "id",
            CompareOp::Gt,
            Operand::Value(Value::Int(18)),
        )),
        ConditionNode::leaf(Comparison::new(
            "id",
            CompareOp::In,
            Operand::SubQuery(SubQueryRef {
                assembly: "missing_inner".into(),
                column: "id".into(),
            }),
        )),
    ]));
    service.sandbox().put_assembly(outer).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let plan = service.get_query_plan("orders_view", &ctx).unwrap();
    assert!(plan.contains("dropped conditions: 1"), "plan was:\n{}", plan);

    // The surviving condition still filters.
    let mut lens = service.get_table_lens("orders_view", &ctx).unwrap();
    let rows = snapshot(lens.as_mut());
    assert_eq!(rows.len(), 3); // header + ids 19, 20
}

#[test]
fn test_unparseable_sql_falls_back_to_local() {
    let (service, source) = service_with(FakeSource::new());
    let mut asm = TableAssembly::new(
        "authored",
        AssemblyKind::Sql,
        SourceInfo::Sql {
            source: "db".into(),
            text: "SELEC broken FRM nowhere".into(),
        },
    );
    asm.selection = ColumnSelection::new(vec![ColumnRef::new(None, "x", DataType::Integer)]);
    service.sandbox().put_assembly(asm).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let plan = service.get_query_plan("authored", &ctx).unwrap();
    // Everything is deferred; the authored text runs verbatim.
    assert!(plan.contains("phase: UNMERGED"), "plan was:\n{}", plan);
    assert!(source.executed_sql().is_empty());
}

#[test]
fn test_cube_aggregation_gated_by_flavor() {
    let cube_rows = TableData::new(
        vec!["region".into(), "sales".into()],
        vec![
            vec![Value::Str("east".into()), Value::Int(10)],
            vec![Value::Str("east".into()), Value::Int(5)],
            vec![Value::Str("west".into()), Value::Int(7)],
        ],
    );
    for (cube_type, expect_merged) in [
        (CubeType::Mondrian, true),
        (CubeType::Other, false),
    ] {
        let (service, _) =
            service_with(FakeSource::new().with_table("salescube", cube_rows.clone()));
        let mut asm = TableAssembly::new(
            "cube_view",
            AssemblyKind::Cube,
            SourceInfo::Cube {
                source: "olap".into(),
                cube: "salescube".into(),
                cube_type,
            },
        );
        asm.selection = ColumnSelection::new(vec![
            ColumnRef::new(None, "region", DataType::String),
            ColumnRef::new(None, "sales", DataType::Integer),
        ]);
        asm.aggregate.groups.push("region".into());
        asm.aggregate.aggregates.push(tessera::model::AggregateRef::new(
            "sales",
            tessera::model::AggregateFormula::Sum,
        ));
        service.sandbox().put_assembly(asm).unwrap();

        let ctx = ExecutionContext::new("u", "acme");
        let plan = service.get_query_plan("cube_view", &ctx).unwrap();
        if expect_merged {
            assert!(plan.contains("cube aggregate"), "plan was:\n{}", plan);
        } else {
            assert!(plan.contains("summary"), "plan was:\n{}", plan);
        }

        // Either way the result is the aggregated table.
        let mut lens = service.get_table_lens("cube_view", &ctx).unwrap();
        let rows = snapshot(lens.as_mut());
        assert_eq!(rows.len(), 3);
        assert!(rows[1..].iter().any(|r| r[0] == "east" && r[1] == "15"));
        assert!(rows[1..].iter().any(|r| r[0] == "west" && r[1] == "7"));
    }
}

#[test]
fn test_mirror_follows_base() {
    let (service, _) = service_with(FakeSource::new().with_table("orders", orders_table()));
    let mut base = TableAssembly::bound("base_view", "db", "orders");
    base.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "id", DataType::Integer),
        ColumnRef::new(None, "name", DataType::String),
    ]);
    service.sandbox().put_assembly(base).unwrap();

    let mut mirror = TableAssembly::new(
        "mirror_view",
        AssemblyKind::Mirror,
        SourceInfo::Mirror {
            base: "base_view".into(),
        },
    );
    mirror.max_rows = 3;
    service.sandbox().put_assembly(mirror).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let mut lens = service.get_table_lens("mirror_view", &ctx).unwrap();
    let rows = snapshot(lens.as_mut());
    assert_eq!(rows.len(), 4); // header + 3
}

#[test]
fn test_cancellation_surfaces_as_cancelled() {
    let (service, _) = service_with(FakeSource::new().with_table("orders", orders_table()));
    let mut asm = TableAssembly::bound("orders_view", "db", "orders");
    asm.selection = ColumnSelection::new(vec![ColumnRef::new(None, "id", DataType::Integer)]);
    service.sandbox().put_assembly(asm).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    ctx.cancel();
    match service.get_table_lens("orders_view", &ctx) {
        Err(RuntimeError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| "lens")),
    }
}

#[test]
fn test_cache_hit_on_second_request() {
    let (service, source) = service_with(FakeSource::new().with_table("orders", orders_table()));
    let mut asm = TableAssembly::bound("orders_view", "db", "orders");
    asm.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "id", DataType::Integer),
        ColumnRef::new(None, "name", DataType::String),
    ]);
    service.sandbox().put_assembly(asm).unwrap();

    let ctx = ExecutionContext::new("u", "acme");
    let _ = service.get_table_lens("orders_view", &ctx).unwrap();
    let executions_after_first = source.executed_sql().len();
    let mut lens = service.get_table_lens("orders_view", &ctx).unwrap();
    assert_eq!(source.executed_sql().len(), executions_after_first);
    assert_eq!(snapshot(lens.as_mut()).len(), 21);

    // Invalidation forces re-execution.
    service.clear_cache("orders_view");
    let _ = service.get_table_lens("orders_view", &ctx).unwrap();
    assert_eq!(source.executed_sql().len(), executions_after_first + 1);
}
