//! Formula column evaluation and the pure-alias fast path.

use std::sync::Arc;

use tessera::lens::{BoxLens, FormulaColumn, FormulaLens, MemoryLens, TableData, TableLens};
use tessera::model::{DataType, Value};

fn items() -> BoxLens {
    Box::new(MemoryLens::new(Arc::new(TableData::new(
        vec!["sku".into(), "price".into(), "qty".into()],
        vec![
            vec![Value::Str("a1".into()), Value::Float(2.5), Value::Int(4)],
            vec![Value::Str("b2".into()), Value::Float(10.0), Value::Int(2)],
            vec![Value::Str("c3".into()), Value::Null, Value::Int(7)],
        ],
    ))))
}

const TYPES: [Option<DataType>; 3] = [
    Some(DataType::String),
    Some(DataType::Double),
    Some(DataType::Integer),
];

#[test]
fn test_arithmetic_formula() {
    let formulas = vec![FormulaColumn::new(
        "total",
        "field['price'] * field['qty']",
        DataType::Double,
    )];
    let mut lens = FormulaLens::new(items(), formulas, &TYPES);
    assert!(lens.more_rows(2));
    assert_eq!(lens.cell(0, 3).to_display(), "total");
    assert_eq!(lens.cell(1, 3), Value::Float(10.0));
    assert_eq!(lens.cell(2, 3), Value::Float(20.0));
}

#[test]
fn test_conditional_formula() {
    let formulas = vec![FormulaColumn::new(
        "tier",
        "field['qty'] >= 4 and 'bulk' or 'unit'",
        DataType::String,
    )];
    let mut lens = FormulaLens::new(items(), formulas, &TYPES);
    assert!(lens.more_rows(2));
    assert_eq!(lens.cell(1, 3), Value::Str("bulk".into()));
    assert_eq!(lens.cell(2, 3), Value::Str("unit".into()));
}

#[test]
fn test_null_input_yields_null_result() {
    let formulas = vec![FormulaColumn::new(
        "total",
        "field['price'] * field['qty']",
        DataType::Double,
    )];
    let mut lens = FormulaLens::new(items(), formulas, &TYPES);
    assert!(lens.more_rows(3));
    // Row 3 has a null price; the script errors on nil arithmetic and
    // the cell degrades to null instead of failing the query.
    assert_eq!(lens.cell(3, 3), Value::Null);
}

#[test]
fn test_pure_alias_equals_scripted_both_quote_styles() {
    for body in ["field['price']", r#"field["price"]"#] {
        let formulas = vec![FormulaColumn::new("p", body, DataType::Double)];
        let mut fast = FormulaLens::new(items(), formulas.clone(), &TYPES);
        // Unknown base types force the scripted path.
        let mut slow = FormulaLens::new(items(), formulas, &[None, None, None]);
        assert!(fast.more_rows(2) && slow.more_rows(2));
        for r in 1..=2 {
            assert_eq!(fast.cell(r, 3), slow.cell(r, 3), "body {:?} row {}", body, r);
        }
    }
}

#[test]
fn test_alias_with_type_mismatch_not_projected() {
    // Declared Integer over a Double column: not provably the same
    // runtime type, so the scripted path must be taken (and still
    // produce the underlying value).
    let formulas = vec![FormulaColumn::new("p", "field['price']", DataType::Integer)];
    let mut lens = FormulaLens::new(items(), formulas, &TYPES);
    assert!(lens.more_rows(1));
    assert_eq!(lens.cell(1, 3), Value::Float(2.5));
}

#[test]
fn test_alternate_name_resolves_aliased_column() {
    // The lens headers show an alias ("unit_price"); the body addresses
    // the underlying attribute. The alternate-name binding makes both
    // spellings reach the same cell.
    let aliased: BoxLens = Box::new(MemoryLens::new(Arc::new(TableData::new(
        vec!["sku".into(), "unit_price".into(), "qty".into()],
        vec![vec![Value::Str("a1".into()), Value::Float(2.5), Value::Int(4)]],
    ))));
    let formulas = vec![FormulaColumn::new(
        "total",
        "field['price'] * field['qty']",
        DataType::Double,
    )];
    let mut lens = FormulaLens::new(aliased, formulas, &TYPES)
        .with_alt_names(vec![None, Some("price".into()), None]);
    assert!(lens.more_rows(1));
    assert_eq!(lens.cell(1, 3), Value::Float(10.0));
}

#[test]
fn test_string_concat_formula() {
    let formulas = vec![FormulaColumn::new(
        "label",
        "field['sku'] .. '-' .. field['qty']",
        DataType::String,
    )];
    let mut lens = FormulaLens::new(items(), formulas, &TYPES);
    assert!(lens.more_rows(1));
    assert_eq!(lens.cell(1, 3), Value::Str("a1-4".into()));
}
