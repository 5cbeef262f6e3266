//! Operator chain behavior: composition, purity, span handling.

use std::sync::Arc;

use tessera::lens::{
    materialize, BoxLens, ColumnMapLens, DistinctLens, FilterLens, JoinKind, JoinLens,
    MaxRowsLens, MemoryLens, RotateLens, SetOp, SetOpLens, SortLens, SummaryLens, TableData,
    TableLens,
};
use tessera::model::{
    AggregateFormula, CompareOp, Comparison, ConditionNode, Operand, Value,
};

fn orders() -> BoxLens {
    Box::new(MemoryLens::new(Arc::new(TableData::new(
        vec!["id".into(), "region".into(), "amount".into()],
        vec![
            vec![Value::Int(1), Value::Str("east".into()), Value::Int(10)],
            vec![Value::Int(2), Value::Str("west".into()), Value::Int(25)],
            vec![Value::Int(3), Value::Str("east".into()), Value::Int(5)],
            vec![Value::Int(4), Value::Str("west".into()), Value::Int(40)],
            vec![Value::Int(5), Value::Str("east".into()), Value::Int(15)],
        ],
    ))))
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

#[test]
fn test_chain_filter_sort_limit() {
    let cond = ConditionNode::leaf(Comparison::new(
        "amount",
        CompareOp::Ge,
        Operand::Value(Value::Int(10)),
    ));
    let filtered: BoxLens = Box::new(FilterLens::new(orders(), Some(cond)));
    let sorted: BoxLens = Box::new(SortLens::new(filtered, vec![(2, false)]));
    let mut limited = MaxRowsLens::new(sorted, 2);

    let rows = snapshot(&mut limited);
    assert_eq!(rows.len(), 3); // header + 2
    assert_eq!(rows[1][2], "40");
    assert_eq!(rows[2][2], "25");
}

#[test]
fn test_repeated_reads_are_pure() {
    // Same chain, same upstream: every re-read of a realized region
    // must return identical cells.
    let cond = ConditionNode::leaf(Comparison::new(
        "region",
        CompareOp::Eq,
        Operand::Value(Value::Str("east".into())),
    ));
    let filtered: BoxLens = Box::new(FilterLens::new(orders(), Some(cond)));
    let mut sorted = SortLens::new(filtered, vec![(2, true)]);

    let first = snapshot(&mut sorted);
    let second = snapshot(&mut sorted);
    let third = snapshot(&mut sorted);
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(first[1][2], "5");
}

#[test]
fn test_same_input_same_output_fresh_chain() {
    let build = || {
        let summary: BoxLens = Box::new(SummaryLens::new(
            orders(),
            vec![1],
            vec![(2, AggregateFormula::Sum, "total".into())],
        ));
        let mut sorted = SortLens::new(summary, vec![(0, true)]);
        snapshot(&mut sorted)
    };
    assert_eq!(build(), build());
}

#[test]
fn test_summary_totals() {
    let mut summary = SummaryLens::new(
        orders(),
        vec![1],
        vec![
            (2, AggregateFormula::Sum, "total".into()),
            (0, AggregateFormula::Count, "n".into()),
        ],
    );
    let rows = snapshot(&mut summary);
    assert_eq!(rows[0], vec!["region", "total", "n"]);
    assert_eq!(rows[1], vec!["east", "30", "3"]);
    assert_eq!(rows[2], vec!["west", "65", "2"]);
}

#[test]
fn test_join_then_project() {
    let regions: BoxLens = Box::new(MemoryLens::new(Arc::new(TableData::new(
        vec!["name".into(), "manager".into()],
        vec![
            vec![Value::Str("east".into()), Value::Str("ann".into())],
            vec![Value::Str("west".into()), Value::Str("bob".into())],
        ],
    ))));
    let joined: BoxLens = Box::new(JoinLens::new(
        orders(),
        regions,
        JoinKind::Inner,
        vec![1],
        vec![0],
    ));
    let mut projected = ColumnMapLens::new(joined, vec![0, 4]);
    let rows = snapshot(&mut projected);
    assert_eq!(rows[0], vec!["id", "manager"]);
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[1], vec!["1", "ann"]);
}

#[test]
fn test_set_ops_compose() {
    let left: BoxLens = Box::new(MemoryLens::new(Arc::new(TableData::new(
        vec!["v".into()],
        vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]],
    ))));
    let right: BoxLens = Box::new(MemoryLens::new(Arc::new(TableData::new(
        vec!["v".into()],
        vec![vec![Value::Int(2)], vec![Value::Int(4)]],
    ))));
    let union: BoxLens = Box::new(SetOpLens::new(left, right, SetOp::Union { distinct: true }));
    let mut distinct = DistinctLens::new(union, None);
    let rows = snapshot(&mut distinct);
    assert_eq!(rows.len(), 5); // header + 1,2,3,4
}

#[test]
fn test_rotate_round_trip_dimensions() {
    let mut rotated = RotateLens::new(orders());
    assert!(rotated.more_rows(2));
    assert_eq!(rotated.row_count(), 3); // old column count
    assert_eq!(rotated.col_count(), 6); // old row count incl. header
}

#[test]
fn test_materialize_preserves_chain_output() {
    let cond = ConditionNode::leaf(Comparison::new(
        "region",
        CompareOp::Eq,
        Operand::Value(Value::Str("west".into())),
    ));
    let mut chain = FilterLens::new(orders(), Some(cond));
    let (data, truncated) = materialize(&mut chain, 0);
    assert!(!truncated);
    assert_eq!(data.data_rows(), 2);
    assert_eq!(data.rows[0][0], Value::Int(2));

    // The realized table reads back identically through a lens.
    let mut reread = MemoryLens::new(Arc::new(data));
    let rows = snapshot(&mut reread);
    assert_eq!(rows[2][2], "40");
}

#[test]
fn test_dispose_propagates_without_panic() {
    let cond = ConditionNode::leaf(Comparison::new(
        "id",
        CompareOp::Gt,
        Operand::Value(Value::Int(0)),
    ));
    let filtered: BoxLens = Box::new(FilterLens::new(orders(), Some(cond)));
    let mut sorted = SortLens::new(filtered, vec![(0, true)]);
    sorted.more_rows(1);
    sorted.dispose();
}
