//! Grouping and aggregation.

use std::collections::{BTreeSet, HashMap};

use crate::model::{AggregateFormula, Value};

use super::{row_not_realized, BoxLens, TableLens};

/// Accumulates one aggregate over one group.
#[derive(Debug, Clone)]
struct Accumulator {
    formula: AggregateFormula,
    count: usize,
    sum: f64,
    int_only: bool,
    min: Option<Value>,
    max: Option<Value>,
    first: Option<Value>,
    last: Option<Value>,
    distinct: BTreeSet<Value>,
}

impl Accumulator {
    fn new(formula: AggregateFormula) -> Self {
        Self {
            formula,
            count: 0,
            sum: 0.0,
            int_only: true,
            min: None,
            max: None,
            first: None,
            last: None,
            distinct: BTreeSet::new(),
        }
    }

    fn update(&mut self, value: Value) {
        if value.is_null() {
            return;
        }
        self.count += 1;
        if let Some(n) = value.as_f64() {
            self.sum += n;
            if !matches!(value, Value::Int(_)) {
                self.int_only = false;
            }
        }
        if self.min.as_ref().is_none_or(|m| value < *m) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().is_none_or(|m| value > *m) {
            self.max = Some(value.clone());
        }
        if self.first.is_none() {
            self.first = Some(value.clone());
        }
        self.last = Some(value.clone());
        if self.formula == AggregateFormula::DistinctCount {
            self.distinct.insert(value);
        }
    }

    fn finish(&self) -> Value {
        match self.formula {
            AggregateFormula::Sum => {
                if self.count == 0 {
                    Value::Null
                } else if self.int_only {
                    Value::Int(self.sum as i64)
                } else {
                    Value::Float(self.sum)
                }
            }
            AggregateFormula::Count => Value::Int(self.count as i64),
            AggregateFormula::DistinctCount => Value::Int(self.distinct.len() as i64),
            AggregateFormula::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float(self.sum / self.count as f64)
                }
            }
            AggregateFormula::Min => self.min.clone().unwrap_or(Value::Null),
            AggregateFormula::Max => self.max.clone().unwrap_or(Value::Null),
            AggregateFormula::First => self.first.clone().unwrap_or(Value::Null),
            AggregateFormula::Last => self.last.clone().unwrap_or(Value::Null),
        }
    }
}

/// One aggregate output definition: source column, formula, name.
pub type SummaryAggregate = (usize, AggregateFormula, String);

/// Groups the base by a column subset and aggregates the rest. Groups
/// surface in first-appearance order; output columns are the group
/// columns followed by the aggregates. Inherently eager, but the base
/// is still drained row by row.
pub struct SummaryLens {
    base: BoxLens,
    group_cols: Vec<usize>,
    aggregates: Vec<SummaryAggregate>,
    /// (group key, accumulators) in first-appearance order.
    groups: Vec<(Vec<Value>, Vec<Accumulator>)>,
    built: bool,
}

impl SummaryLens {
    pub fn new(base: BoxLens, group_cols: Vec<usize>, aggregates: Vec<SummaryAggregate>) -> Self {
        Self {
            base,
            group_cols,
            aggregates,
            groups: Vec::new(),
            built: false,
        }
    }

    fn build(&mut self) {
        if self.built {
            return;
        }
        self.built = true;

        let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
        let mut row = 1;
        while self.base.more_rows(row) {
            let key: Vec<Value> = self
                .group_cols
                .iter()
                .map(|&c| self.base.cell(row, c))
                .collect();
            let slot = match index.get(&key) {
                Some(&i) => i,
                None => {
                    let accs = self
                        .aggregates
                        .iter()
                        .map(|(_, f, _)| Accumulator::new(*f))
                        .collect();
                    self.groups.push((key.clone(), accs));
                    index.insert(key, self.groups.len() - 1);
                    self.groups.len() - 1
                }
            };
            for (i, (col, _, _)) in self.aggregates.iter().enumerate() {
                let value = self.base.cell(row, *col);
                self.groups[slot].1[i].update(value);
            }
            row += 1;
        }
    }
}

impl TableLens for SummaryLens {
    fn more_rows(&mut self, row: usize) -> bool {
        self.build();
        row <= self.groups.len()
    }

    fn row_count(&self) -> usize {
        self.groups.len() + 1
    }

    fn col_count(&self) -> usize {
        self.group_cols.len() + self.aggregates.len()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        let group_count = self.group_cols.len();
        if row == 0 {
            return if col < group_count {
                self.base.cell(0, self.group_cols[col])
            } else {
                Value::Str(self.aggregates[col - group_count].2.clone())
            };
        }
        let Some((key, accs)) = self.groups.get(row - 1) else {
            row_not_realized(row)
        };
        if col < group_count {
            key[col].clone()
        } else {
            accs[col - group_count].finish()
        }
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
