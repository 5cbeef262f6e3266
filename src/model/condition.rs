//! Condition trees.
//!
//! Conditions are trees of comparisons joined by AND/OR. A comparison's
//! right-hand side may be a literal, a list, another column, a nested
//! query (resolved by the planner into a value set before row
//! evaluation), or a pre-resolved value set.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    In,
    Between,
    IsNull,
}

/// Junction between sibling conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Junction {
    And,
    Or,
}

/// A nested-query operand: the named assembly's `column` values are
/// compared against the outer row. The planner executes the inner
/// assembly once (distinct) and rewrites this operand to `ValueSet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQueryRef {
    pub assembly: String,
    pub column: String,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(Value),
    Values(Vec<Value>),
    /// Another column in the same table, by output name.
    Column(String),
    SubQuery(SubQueryRef),
    /// Materialized sub-query result. Skipped during serialization:
    /// a resolved set is execution state, not definition state.
    #[serde(skip)]
    ValueSet(Arc<BTreeSet<Value>>),
    None,
}

/// A single comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Output name of the column being tested.
    pub column: String,
    pub op: CompareOp,
    pub operand: Operand,
    pub negated: bool,
}

impl Comparison {
    pub fn new(column: &str, op: CompareOp, operand: Operand) -> Self {
        Self {
            column: column.to_string(),
            op,
            operand,
            negated: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negated = true;
        self
    }

    /// Whether this comparison still carries an unresolved nested query.
    pub fn has_subquery(&self) -> bool {
        matches!(self.operand, Operand::SubQuery(_))
    }
}

/// A condition tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionNode {
    Leaf(Comparison),
    Group {
        junction: Junction,
        children: Vec<ConditionNode>,
    },
}

impl ConditionNode {
    pub fn leaf(cmp: Comparison) -> Self {
        ConditionNode::Leaf(cmp)
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            junction: Junction::And,
            children,
        }
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            junction: Junction::Or,
            children,
        }
    }

    /// All comparisons in the tree, depth-first.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            ConditionNode::Leaf(c) => out.push(c),
            ConditionNode::Group { children, .. } => {
                for child in children {
                    child.collect(out);
                }
            }
        }
    }

    /// Whether any comparison in the tree carries an unresolved
    /// nested query.
    pub fn has_subquery(&self) -> bool {
        self.comparisons().iter().any(|c| c.has_subquery())
    }

    /// Rewrite every comparison in place.
    pub fn map_comparisons(&mut self, f: &mut impl FnMut(&mut Comparison)) {
        match self {
            ConditionNode::Leaf(c) => f(c),
            ConditionNode::Group { children, .. } => {
                for child in children {
                    child.map_comparisons(f);
                }
            }
        }
    }

    /// Drop comparisons the predicate rejects. A group whose children
    /// are all dropped is dropped itself. Returns the number removed.
    pub fn retain_comparisons(
        node: &mut Option<ConditionNode>,
        keep: &impl Fn(&Comparison) -> bool,
    ) -> usize {
        let mut dropped = 0;
        if let Some(n) = node.take() {
            match Self::retain_inner(n, keep, &mut dropped) {
                Some(kept) => *node = Some(kept),
                None => *node = None,
            }
        }
        dropped
    }

    fn retain_inner(
        node: ConditionNode,
        keep: &impl Fn(&Comparison) -> bool,
        dropped: &mut usize,
    ) -> Option<ConditionNode> {
        match node {
            ConditionNode::Leaf(c) => {
                if keep(&c) {
                    Some(ConditionNode::Leaf(c))
                } else {
                    *dropped += 1;
                    None
                }
            }
            ConditionNode::Group { junction, children } => {
                let kept: Vec<ConditionNode> = children
                    .into_iter()
                    .filter_map(|c| Self::retain_inner(c, keep, dropped))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(ConditionNode::Group {
                        junction,
                        children: kept,
                    })
                }
            }
        }
    }
}
