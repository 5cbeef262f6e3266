//! Fingerprint stability and compaction determinism.

use std::collections::BTreeMap;

use tessera::cache::{compact, DataKey};
use tessera::model::{
    ColumnRef, ColumnSelection, CompareOp, Comparison, ConditionNode, DataType, ExecMode, Operand,
    SortKey, TableAssembly, Value,
};

fn assembly() -> TableAssembly {
    let mut asm = TableAssembly::bound("orders_view", "db", "orders");
    asm.selection = ColumnSelection::new(vec![
        ColumnRef::new(None, "id", DataType::Integer),
        ColumnRef::new(None, "name", DataType::String),
        ColumnRef::new(None, "amount", DataType::Double).with_alias("total"),
    ]);
    asm.pre_conditions = Some(ConditionNode::and(vec![
        ConditionNode::leaf(Comparison::new(
            "id",
            CompareOp::Gt,
            Operand::Value(Value::Int(5)),
        )),
        ConditionNode::leaf(Comparison::new(
            "name",
            CompareOp::Like,
            Operand::Value(Value::Str("a%".into())),
        )),
    ]));
    asm.sort.keys.push(SortKey::asc("name"));
    asm.max_rows = 100;
    asm
}

fn key(asm: &TableAssembly, vars: &BTreeMap<String, Value>, user: &str) -> DataKey {
    DataKey::compute(asm, vars, user, ExecMode::Runtime, false, 0, 0, false).unwrap()
}

#[test]
fn test_identical_state_identical_key() {
    let vars: BTreeMap<String, Value> = [("p".to_string(), Value::Int(1))].into();
    let a = key(&assembly(), &vars, "alice");
    let b = key(&assembly(), &vars, "alice");
    assert_eq!(a, b);
}

#[test]
fn test_structural_equivalence_ignores_display_name() {
    let vars = BTreeMap::new();
    let a = assembly();
    let mut b = assembly();
    b.name = "different_display_name".into();
    assert_eq!(key(&a, &vars, "u"), key(&b, &vars, "u"));
}

#[test]
fn test_mutations_change_key() {
    let vars = BTreeMap::new();
    let base = key(&assembly(), &vars, "u");

    // Condition change.
    let mut m = assembly();
    m.pre_conditions = Some(ConditionNode::leaf(Comparison::new(
        "id",
        CompareOp::Ge,
        Operand::Value(Value::Int(5)),
    )));
    assert_ne!(base, key(&m, &vars, "u"));

    // Column selection change.
    let mut m = assembly();
    m.selection.columns[2].alias = Some("grand_total".into());
    assert_ne!(base, key(&m, &vars, "u"));

    // Sort change.
    let mut m = assembly();
    m.sort.keys[0] = SortKey::desc("name");
    assert_ne!(base, key(&m, &vars, "u"));

    // Row limit change.
    let mut m = assembly();
    m.max_rows = 99;
    assert_ne!(base, key(&m, &vars, "u"));
}

#[test]
fn test_variables_user_and_mode_distinguish() {
    let asm = assembly();
    let no_vars = BTreeMap::new();
    let vars: BTreeMap<String, Value> = [("region".to_string(), Value::Str("east".into()))].into();

    assert_ne!(key(&asm, &no_vars, "u"), key(&asm, &vars, "u"));
    assert_ne!(key(&asm, &no_vars, "alice"), key(&asm, &no_vars, "bob"));

    let design = DataKey::compute(
        &asm,
        &no_vars,
        "u",
        ExecMode::Design,
        false,
        0,
        0,
        false,
    )
    .unwrap();
    assert_ne!(key(&asm, &no_vars, "u"), design);
}

#[test]
fn test_ignore_filtering_excludes_conditions() {
    let asm = assembly();
    let mut unfiltered = assembly();
    unfiltered.pre_conditions = None;
    let vars = BTreeMap::new();

    let a = DataKey::compute(&asm, &vars, "u", ExecMode::Runtime, false, 0, 0, true).unwrap();
    let b = DataKey::compute(
        &unfiltered,
        &vars,
        "u",
        ExecMode::Runtime,
        false,
        0,
        0,
        true,
    )
    .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_compaction_deterministic_at_5000() {
    let long: String = (0..5000)
        .map(|i| char::from(b'a' + (i % 23) as u8))
        .collect();
    assert_eq!(long.len(), 5000);
    let first = compact(&long);
    let second = compact(&long);
    assert_eq!(first, second);
    assert!(first.len() < 2000);
}

#[test]
fn test_compaction_distinguishes_inputs() {
    let a: String = "x".repeat(5000);
    let mut b = a.clone();
    b.replace_range(4999..5000, "y");
    assert_ne!(compact(&a), compact(&b));
}
