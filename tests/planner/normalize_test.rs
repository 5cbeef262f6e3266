//! Cache normalization rules: alias-removal safety, reorder
//! eligibility, rotated-selection fix-up.

use tessera::config::LimitSettings;
use tessera::model::{
    ColumnRef, ColumnSelection, DataType, ExecMode, SortKey, TableAssembly,
};
use tessera::planner::{fix_rotated_selection, normalize_columns};

fn assembly(cols: Vec<ColumnRef>) -> TableAssembly {
    let mut asm = TableAssembly::bound("a", "db", "t");
    asm.selection = ColumnSelection::new(cols);
    asm
}

fn limits() -> LimitSettings {
    LimitSettings::default()
}

#[test]
fn test_alias_never_stripped_when_expression_references_it() {
    // Property: for expressions containing field['alias'] in either
    // quote style, the alias survives normalization.
    for body in [
        "field['total'] + 1",
        r#"field["total"] + 1"#,
        "  field [ 'total' ] * 2",
        r#"10 - field [ "total" ]"#,
    ] {
        let asm = assembly(vec![
            ColumnRef::new(None, "amount", DataType::Double).with_alias("total"),
            ColumnRef::new(None, "qty", DataType::Integer),
            ColumnRef::expression("derived", body, DataType::Double),
        ]);
        // The expression keeps the node off the plain-column path, so
        // probe the strip rule through a selection where only the
        // hidden expression mentions the alias.
        let mut probe = asm.clone();
        probe.selection.columns[2].visible = false;
        let norm = normalize_columns(&probe, ExecMode::Runtime, &limits());
        if let Some(norm) = norm {
            let aliased = norm
                .items
                .iter()
                .find(|i| i.name == "amount")
                .expect("amount present");
            assert_eq!(
                aliased.alias.as_deref(),
                Some("total"),
                "alias must survive with body {:?}",
                body
            );
        }
    }
}

#[test]
fn test_unreferenced_alias_is_stripped() {
    let asm = assembly(vec![
        ColumnRef::new(None, "amount", DataType::Double).with_alias("total"),
        ColumnRef::new(None, "qty", DataType::Integer),
    ]);
    let norm = normalize_columns(&asm, ExecMode::Runtime, &limits()).unwrap();
    assert!(norm.stripped_aliases);
    assert!(norm.items.iter().all(|i| i.alias.is_none()));
    // Restore data keeps the caller's headers.
    assert_eq!(norm.requested_names, vec!["total", "qty"]);
}

#[test]
fn test_expression_column_alias_never_stripped() {
    // The computed column is appended locally under its output name;
    // stripping its alias would rename it away from the restore
    // projection.
    let asm = assembly(vec![
        ColumnRef::new(None, "amount", DataType::Double),
        ColumnRef::expression("calc", "field['amount'] * 2", DataType::Double)
            .with_alias("doubled"),
    ]);
    let norm = normalize_columns(&asm, ExecMode::Runtime, &limits()).unwrap();
    assert!(!norm.stripped_aliases);
    assert_eq!(norm.project_names, vec!["amount", "doubled"]);
    assert_eq!(norm.requested_names, vec!["amount", "doubled"]);
}

#[test]
fn test_aggregation_disables_alias_strip() {
    let mut asm = assembly(vec![
        ColumnRef::new(None, "amount", DataType::Double).with_alias("total"),
    ]);
    asm.aggregate.groups.push("total".into());
    assert!(normalize_columns(&asm, ExecMode::Runtime, &limits()).is_none());
}

#[test]
fn test_columns_sorted_for_key_stability() {
    let asm = assembly(vec![
        ColumnRef::new(None, "qty", DataType::Integer),
        ColumnRef::new(None, "amount", DataType::Double),
        ColumnRef::new(None, "id", DataType::Integer),
    ]);
    let norm = normalize_columns(&asm, ExecMode::Runtime, &limits()).unwrap();
    let names: Vec<&str> = norm.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["amount", "id", "qty"]);
    // Requested order restored by the trailing projection.
    assert_eq!(norm.project_names, vec!["qty", "amount", "id"]);
}

#[test]
fn test_distinct_empty_sort_ineligible() {
    let mut asm = assembly(vec![ColumnRef::new(None, "b", DataType::Integer)]);
    asm.distinct = true;
    assert!(normalize_columns(&asm, ExecMode::Runtime, &limits()).is_none());
    asm.sort.keys.push(SortKey::asc("b"));
    assert!(normalize_columns(&asm, ExecMode::Runtime, &limits()).is_some());
}

#[test]
fn test_positional_field_reference_ineligible() {
    for body in ["field[0][1]", "field [ 2 ] [ 3 ] + 1"] {
        let asm = assembly(vec![
            ColumnRef::new(None, "a", DataType::Integer),
            ColumnRef::expression("pos", body, DataType::Integer),
        ]);
        assert!(
            normalize_columns(&asm, ExecMode::Runtime, &limits()).is_none(),
            "positional body {:?} must be ineligible",
            body
        );
    }
}

#[test]
fn test_snapshot_export_ineligible() {
    let asm = assembly(vec![ColumnRef::new(None, "a", DataType::Integer)]);
    assert!(normalize_columns(&asm, ExecMode::Snapshot, &limits()).is_none());
}

// =============================================================================
// Rotated-selection fix-up
// =============================================================================

#[test]
fn test_fixup_single_column() {
    let original = ColumnSelection::new(vec![ColumnRef::new(None, "m", DataType::String)]);
    let fixed = fix_rotated_selection(&original, &["only".to_string()], 250);
    assert_eq!(fixed.output_names(), vec!["only"]);
}

#[test]
fn test_fixup_two_columns_match_headers_exactly() {
    let original = ColumnSelection::new(vec![
        ColumnRef::new(None, "metric", DataType::String),
        ColumnRef::new(None, "q1", DataType::Integer),
    ]);
    let headers = vec!["metric".to_string(), "sales".to_string()];
    let fixed = fix_rotated_selection(&original, &headers, 250);
    assert_eq!(fixed.output_names(), headers);
    // Types carry over where the header matches an original column.
    assert_eq!(fixed.columns[0].data_type, DataType::String);
}

#[test]
fn test_fixup_cap_enforced_at_250() {
    let original = ColumnSelection::new(vec![ColumnRef::new(None, "m", DataType::String)]);
    let headers: Vec<String> = (0..400).map(|i| format!("h{}", i)).collect();
    let fixed = fix_rotated_selection(&original, &headers, 250);
    assert_eq!(fixed.len(), 250);
    assert_eq!(fixed.output_names(), headers[..250].to_vec());
}
