//! Row filtering over a condition tree.

use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use crate::model::{CompareOp, Comparison, ConditionNode, Junction, Operand, Value};

use super::{row_not_realized, BoxLens, LensCaps, Span, TableLens};

/// Filters data rows by a condition tree. The header row always passes.
///
/// Nested-query conditions must be resolved to value sets before the
/// chain is built; an unresolved one evaluates as always-true here (the
/// planner already logged the drop).
pub struct FilterLens {
    base: BoxLens,
    condition: Option<ConditionNode>,
    col_index: HashMap<String, usize>,
    /// Output row -> base row. Entry 0 is the header row.
    rows: Vec<usize>,
    next_base: usize,
    exhausted: bool,
    like_cache: HashMap<String, Regex>,
}

impl FilterLens {
    pub fn new(mut base: BoxLens, condition: Option<ConditionNode>) -> Self {
        let col_index = if base.more_rows(0) {
            (0..base.col_count())
                .map(|c| (base.cell(0, c).to_display(), c))
                .collect()
        } else {
            HashMap::new()
        };
        Self {
            base,
            condition,
            col_index,
            rows: vec![0],
            next_base: 1,
            exhausted: false,
            like_cache: HashMap::new(),
        }
    }

    fn accepts(&mut self, base_row: usize) -> bool {
        match self.condition.take() {
            None => true,
            Some(cond) => {
                let ok = self.eval(&cond, base_row);
                self.condition = Some(cond);
                ok
            }
        }
    }

    fn eval(&mut self, node: &ConditionNode, row: usize) -> bool {
        match node {
            ConditionNode::Leaf(cmp) => self.eval_comparison(cmp, row),
            ConditionNode::Group { junction, children } => match junction {
                Junction::And => children.iter().all(|c| self.eval(c, row)),
                Junction::Or => children.iter().any(|c| self.eval(c, row)),
            },
        }
    }

    fn column_value(&self, name: &str, row: usize) -> Option<Value> {
        self.col_index.get(name).map(|&c| self.base.cell(row, c))
    }

    fn eval_comparison(&mut self, cmp: &Comparison, row: usize) -> bool {
        let Some(left) = self.column_value(&cmp.column, row) else {
            warn!(column = %cmp.column, "condition references unknown column; dropping test");
            return true;
        };
        let result = match (&cmp.op, &cmp.operand) {
            (CompareOp::IsNull, _) => left.is_null(),
            (_, Operand::SubQuery(_)) => true,
            (op, operand) => {
                if left.is_null() {
                    false
                } else {
                    self.eval_op(*op, &left, operand, row)
                }
            }
        };
        result != cmp.negated
    }

    /// Right-hand value of a comparison, for operand shapes that
    /// yield a single value.
    fn operand_value(&self, operand: &Operand, row: usize) -> Option<Value> {
        match operand {
            Operand::Value(v) => Some(v.clone()),
            Operand::Column(name) => self.column_value(name, row),
            _ => None,
        }
    }

    fn eval_op(&mut self, op: CompareOp, left: &Value, operand: &Operand, row: usize) -> bool {
        match op {
            CompareOp::Eq => self
                .operand_value(operand, row)
                .is_some_and(|r| *left == r),
            CompareOp::Ne => self
                .operand_value(operand, row)
                .is_some_and(|r| *left != r),
            CompareOp::Lt => self.operand_value(operand, row).is_some_and(|r| *left < r),
            CompareOp::Le => self
                .operand_value(operand, row)
                .is_some_and(|r| *left <= r),
            CompareOp::Gt => self.operand_value(operand, row).is_some_and(|r| *left > r),
            CompareOp::Ge => self
                .operand_value(operand, row)
                .is_some_and(|r| *left >= r),
            CompareOp::Like => match (left.as_str(), operand) {
                (Some(text), Operand::Value(Value::Str(pattern))) => {
                    self.like_match(pattern, text)
                }
                _ => false,
            },
            CompareOp::In => match operand {
                Operand::Values(vs) => vs.contains(left),
                Operand::ValueSet(set) => set.contains(left),
                _ => false,
            },
            CompareOp::Between => match operand {
                Operand::Values(vs) if vs.len() == 2 => *left >= vs[0] && *left <= vs[1],
                _ => false,
            },
            CompareOp::IsNull => left.is_null(),
        }
    }

    /// SQL LIKE: `%` matches any run, `_` matches one character.
    fn like_match(&mut self, pattern: &str, text: &str) -> bool {
        if !self.like_cache.contains_key(pattern) {
            let mut re = String::from("^");
            for ch in pattern.chars() {
                match ch {
                    '%' => re.push_str(".*"),
                    '_' => re.push('.'),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');
            match Regex::new(&re) {
                Ok(compiled) => {
                    self.like_cache.insert(pattern.to_string(), compiled);
                }
                Err(e) => {
                    warn!(pattern, error = %e, "invalid LIKE pattern");
                    return false;
                }
            }
        }
        self.like_cache[pattern].is_match(text)
    }
}

impl TableLens for FilterLens {
    fn more_rows(&mut self, row: usize) -> bool {
        while self.rows.len() <= row {
            if self.exhausted {
                return false;
            }
            if !self.base.more_rows(self.next_base) {
                self.exhausted = true;
                return false;
            }
            let r = self.next_base;
            self.next_base += 1;
            if self.accepts(r) {
                self.rows.push(r);
            }
        }
        true
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn col_count(&self) -> usize {
        self.base.col_count()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        match self.rows.get(row) {
            Some(&base_row) => self.base.cell(base_row, col),
            None => row_not_realized(row),
        }
    }

    fn span(&self, row: usize, col: usize) -> Option<Span> {
        self.rows
            .get(row)
            .and_then(|&base_row| self.base.span(base_row, col))
    }

    fn caps(&self) -> LensCaps {
        self.base.caps()
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
