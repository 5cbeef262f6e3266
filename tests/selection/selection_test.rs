//! Selection state invariants across generated association scenarios.

use std::collections::HashSet;
use std::sync::Arc;

use tessera::config::SelectionSettings;
use tessera::lens::{MemoryLens, TableData};
use tessera::model::Value;
use tessera::selection::{state, AssociationInput, SelectionBuilder};

fn scan_of(values: &[&str]) -> MemoryLens {
    MemoryLens::new(Arc::new(TableData::new(
        vec!["v".into()],
        values
            .iter()
            .map(|v| vec![Value::Str((*v).to_string())])
            .collect(),
    )))
}

fn value_set(values: &[&str]) -> HashSet<Value> {
    values.iter().map(|v| Value::Str((*v).to_string())).collect()
}

/// Generated scenarios: every subset shape of applied/associated over
/// a small universe.
fn scenarios() -> Vec<(Vec<&'static str>, Vec<&'static str>, Option<Vec<&'static str>>, bool)> {
    let universe = ["a", "b", "c", "d"];
    let mut out = Vec::new();
    for applied in [vec![], vec!["a"], vec!["a", "c"], vec!["d"]] {
        for associated in [
            None,
            Some(vec!["a", "b"]),
            Some(vec!["b", "c", "d"]),
            Some(vec![]),
        ] {
            for conflicting in [false, true] {
                out.push((universe.to_vec(), applied.clone(), associated.clone(), conflicting));
            }
        }
    }
    out
}

#[test]
fn test_selected_is_subset_of_scan() {
    let settings = SelectionSettings::default();
    let builder = SelectionBuilder::new(&settings);

    for (universe, applied, associated, conflicting) in scenarios() {
        let mut scan = scan_of(&universe);
        let input = AssociationInput {
            applied: value_set(&applied),
            associated: associated.as_ref().map(|a| value_set(a)),
            has_conflicting: conflicting,
        };
        let list = builder.build_list(&mut scan, 0, None, &input, false);

        let scan_values = value_set(&universe);
        for v in list.flattened() {
            // Exactly one state bit, and SELECTED values always come
            // from the scan itself.
            assert_eq!(v.state.count_ones(), 1, "state {:#x}", v.state);
            if v.is_selected() {
                assert!(scan_values.contains(&v.value));
            }
        }
    }
}

#[test]
fn test_applied_values_missing_from_scan_are_not_selected() {
    let settings = SelectionSettings::default();
    let builder = SelectionBuilder::new(&settings);
    let mut scan = scan_of(&["a", "b"]);
    let input = AssociationInput {
        applied: value_set(&["zz"]), // stale selection from an old scan
        associated: None,
        has_conflicting: false,
    };
    let list = builder.build_list(&mut scan, 0, None, &input, false);
    assert!(list.selected_values().is_empty());
}

#[test]
fn test_single_selection_never_exceeds_one() {
    let settings = SelectionSettings::default();
    let builder = SelectionBuilder::new(&settings);

    for (universe, applied, associated, conflicting) in scenarios() {
        let mut scan = scan_of(&universe);
        let input = AssociationInput {
            applied: value_set(&applied),
            associated: associated.as_ref().map(|a| value_set(a)),
            has_conflicting: conflicting,
        };
        let list = builder.build_list(&mut scan, 0, None, &input, true);
        assert!(
            list.selected_values().len() <= 1,
            "applied {:?} associated {:?}",
            applied,
            associated
        );
    }
}

#[test]
fn test_single_selection_auto_selects_first_compatible() {
    let settings = SelectionSettings {
        association_mode: true,
        select_first_item: true,
    };
    let builder = SelectionBuilder::new(&settings);
    let mut scan = scan_of(&["a", "b", "c"]);
    let input = AssociationInput {
        applied: HashSet::new(),
        associated: Some(value_set(&["b", "c"])),
        has_conflicting: false,
    };
    let list = builder.build_list(&mut scan, 0, None, &input, true);
    // "a" is excluded; "b" is the first reachable value.
    assert_eq!(list.selected_values(), vec![&Value::Str("b".into())]);
}

#[test]
fn test_no_auto_select_when_policy_off() {
    let settings = SelectionSettings {
        association_mode: true,
        select_first_item: false,
    };
    let builder = SelectionBuilder::new(&settings);
    let mut scan = scan_of(&["a", "b"]);
    let input = AssociationInput::default();
    let list = builder.build_list(&mut scan, 0, None, &input, true);
    assert!(list.selected_values().is_empty());
}

#[test]
fn test_association_off_everything_compatible() {
    let settings = SelectionSettings {
        association_mode: false,
        select_first_item: false,
    };
    let builder = SelectionBuilder::new(&settings);
    let mut scan = scan_of(&["a", "b", "c"]);
    let input = AssociationInput {
        applied: HashSet::new(),
        associated: Some(value_set(&[])), // would exclude all
        has_conflicting: true,
    };
    let list = builder.build_list(&mut scan, 0, None, &input, false);
    assert!(list.values.iter().all(|v| v.state == state::COMPATIBLE));
}

#[test]
fn test_measure_carried_per_value() {
    let settings = SelectionSettings::default();
    let builder = SelectionBuilder::new(&settings);
    let mut scan = MemoryLens::new(Arc::new(TableData::new(
        vec!["v".into(), "count".into()],
        vec![
            vec![Value::Str("a".into()), Value::Int(12)],
            vec![Value::Str("b".into()), Value::Int(3)],
        ],
    )));
    let list = builder.build_list(&mut scan, 0, Some(1), &AssociationInput::default(), false);
    assert_eq!(list.values[0].measure, Some(Value::Int(12)));
    assert_eq!(list.values[1].measure, Some(Value::Int(3)));
}

#[test]
fn test_deep_tree_truncated_not_overflowed() {
    let settings = SelectionSettings::default();
    let builder = SelectionBuilder::new(&settings);
    // A 150-deep parent chain: assembly must stop at the cap instead
    // of recursing forever or overflowing.
    let rows: Vec<Vec<Value>> = (0..150)
        .map(|i| {
            vec![
                Value::Int(i),
                if i == 0 { Value::Null } else { Value::Int(i - 1) },
                Value::Str(format!("n{}", i)),
            ]
        })
        .collect();
    let mut scan = MemoryLens::new(Arc::new(TableData::new(
        vec!["id".into(), "parent".into(), "v".into()],
        rows,
    )));
    let list = builder.build_tree(
        &mut scan,
        2,
        0,
        1,
        None,
        &AssociationInput::default(),
        false,
    );
    let flat = list.flattened();
    assert!(flat.len() <= 100);
    assert!(!flat.is_empty());
}
