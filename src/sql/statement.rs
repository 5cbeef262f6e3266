//! The progressively-built downstream statement.
//!
//! The merge planner mutates a `Statement` clause by clause as merge
//! phases succeed. `freeze` makes it immutable before execution; a
//! mutator called afterwards is a planner bug surfaced as an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    AggregateFormula, AggregateRef, CompareOp, Comparison, ConditionNode, Junction, Operand,
    SortKey, Value,
};

use super::dialect::Dialect;
use super::token::{Token, TokenStream};

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("statement is frozen; no further clause merging allowed")]
    Frozen,

    #[error("statement has no source table")]
    MissingSource,
}

pub type SqlResult<T> = Result<T, SqlError>;

/// A table reference in the FROM list. `raw` carries the text of a
/// hand-authored statement used as a derived table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementTable {
    pub table: String,
    pub schema: Option<String>,
    pub catalog: Option<String>,
    pub alias: Option<String>,
    pub raw: Option<String>,
}

impl StatementTable {
    pub fn named(table: &str) -> Self {
        Self {
            table: table.to_string(),
            schema: None,
            catalog: None,
            alias: None,
            raw: None,
        }
    }

    pub fn derived(text: &str, alias: &str) -> Self {
        Self {
            table: String::new(),
            schema: None,
            catalog: None,
            alias: Some(alias.to_string()),
            raw: Some(text.to_string()),
        }
    }

    pub fn with_schema(mut self, schema: Option<&str>, catalog: Option<&str>) -> Self {
        self.schema = schema.map(String::from);
        self.catalog = catalog.map(String::from);
        self
    }
}

/// A SELECT list item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectItem {
    pub name: String,
    pub entity: Option<String>,
    pub alias: Option<String>,
    /// Vetted expression text rendered verbatim instead of the name.
    pub expression: Option<String>,
}

impl SelectItem {
    pub fn column(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entity: None,
            alias: None,
            expression: None,
        }
    }

    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// The executable downstream statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub tables: Vec<StatementTable>,
    pub select: Vec<SelectItem>,
    pub predicate: Option<ConditionNode>,
    pub group_by: Vec<String>,
    pub aggregates: Vec<AggregateRef>,
    pub order_by: Vec<SortKey>,
    pub distinct: bool,
    /// 0 means unlimited.
    pub max_rows: usize,

    /// Row/column security rewriting has been applied; a second
    /// application would double the policy predicates.
    #[serde(skip)]
    pub vpm_applied: bool,
    #[serde(skip)]
    frozen: bool,
}

impl Statement {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_mutable(&self) -> SqlResult<()> {
        if self.frozen {
            Err(SqlError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn set_source(&mut self, table: StatementTable) -> SqlResult<()> {
        self.check_mutable()?;
        self.tables = vec![table];
        Ok(())
    }

    pub fn set_select(&mut self, items: Vec<SelectItem>) -> SqlResult<()> {
        self.check_mutable()?;
        self.select = items;
        Ok(())
    }

    pub fn set_predicate(&mut self, predicate: Option<ConditionNode>) -> SqlResult<()> {
        self.check_mutable()?;
        self.predicate = predicate;
        Ok(())
    }

    pub fn set_grouping(
        &mut self,
        group_by: Vec<String>,
        aggregates: Vec<AggregateRef>,
    ) -> SqlResult<()> {
        self.check_mutable()?;
        self.group_by = group_by;
        self.aggregates = aggregates;
        Ok(())
    }

    pub fn set_order_by(&mut self, keys: Vec<SortKey>) -> SqlResult<()> {
        self.check_mutable()?;
        self.order_by = keys;
        Ok(())
    }

    pub fn set_distinct(&mut self, distinct: bool) -> SqlResult<()> {
        self.check_mutable()?;
        self.distinct = distinct;
        Ok(())
    }

    pub fn set_max_rows(&mut self, max_rows: usize) -> SqlResult<()> {
        self.check_mutable()?;
        self.max_rows = max_rows;
        Ok(())
    }

    /// Make the statement immutable. Execution must only see frozen
    /// statements.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Render to SQL text.
    pub fn sql(&self, dialect: Dialect) -> SqlResult<String> {
        if self.tables.is_empty() {
            return Err(SqlError::MissingSource);
        }
        Ok(self.to_tokens(dialect).serialize(dialect))
    }

    fn to_tokens(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::Select);
        if self.distinct {
            ts.space().push(Token::Distinct);
        }
        if self.max_rows > 0 {
            if let Some(prefix) = dialect.limit_prefix(self.max_rows as u64) {
                ts.space().append(&prefix);
            }
        }
        ts.space();
        self.select_tokens(&mut ts);
        ts.push(Token::Newline).push(Token::From).space();
        self.from_tokens(&mut ts);
        if let Some(pred) = &self.predicate {
            ts.push(Token::Newline).push(Token::Where).space();
            condition_tokens(pred, &mut ts);
        }
        if !self.group_by.is_empty() {
            ts.push(Token::Newline).push(Token::GroupBy).space();
            for (i, g) in self.group_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.push(Token::Ident(g.clone()));
            }
        }
        if !self.order_by.is_empty() {
            ts.push(Token::Newline).push(Token::OrderBy).space();
            for (i, key) in self.order_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.push(Token::Ident(key.column.clone())).space().push(
                    if key.ascending {
                        Token::Asc
                    } else {
                        Token::Desc
                    },
                );
            }
        }
        if self.max_rows > 0 {
            if let Some(suffix) = dialect.limit_suffix(self.max_rows as u64) {
                ts.push(Token::Newline).append(&suffix);
            }
        }
        ts
    }

    fn select_tokens(&self, ts: &mut TokenStream) {
        let mut first = true;
        let sep = |ts: &mut TokenStream, first: &mut bool| {
            if !*first {
                ts.comma().space();
            }
            *first = false;
        };

        if self.select.is_empty() && self.aggregates.is_empty() {
            ts.push(Token::Star);
            return;
        }
        for item in &self.select {
            sep(ts, &mut first);
            match &item.expression {
                Some(body) => {
                    ts.push(Token::Raw(body.clone()));
                }
                None => {
                    ts.push(Token::QualifiedIdent {
                        schema: item.entity.clone(),
                        name: item.name.clone(),
                    });
                }
            }
            if let Some(alias) = &item.alias {
                ts.space().push(Token::As).space().push(Token::Ident(alias.clone()));
            }
        }
        for agg in &self.aggregates {
            sep(ts, &mut first);
            aggregate_tokens(agg, ts);
        }
    }

    fn from_tokens(&self, ts: &mut TokenStream) {
        for (i, table) in self.tables.iter().enumerate() {
            if i > 0 {
                ts.comma().space();
            }
            match &table.raw {
                Some(text) => {
                    ts.push(Token::LParen)
                        .push(Token::Raw(text.clone()))
                        .push(Token::RParen);
                }
                None => {
                    if let Some(catalog) = &table.catalog {
                        ts.push(Token::Ident(catalog.clone())).push(Token::Dot);
                    }
                    ts.push(Token::QualifiedIdent {
                        schema: table.schema.clone(),
                        name: table.table.clone(),
                    });
                }
            }
            if let Some(alias) = &table.alias {
                ts.space().push(Token::As).space().push(Token::Ident(alias.clone()));
            }
        }
    }
}

fn aggregate_tokens(agg: &AggregateRef, ts: &mut TokenStream) {
    match agg.formula {
        AggregateFormula::DistinctCount => {
            ts.push(Token::FunctionName("count".into()))
                .push(Token::LParen)
                .push(Token::Distinct)
                .space()
                .push(Token::Ident(agg.column.clone()))
                .push(Token::RParen);
        }
        formula => {
            ts.push(Token::FunctionName(formula.sql_name().into()))
                .push(Token::LParen)
                .push(Token::Ident(agg.column.clone()))
                .push(Token::RParen);
        }
    }
    if let Some(alias) = &agg.alias {
        ts.space().push(Token::As).space().push(Token::Ident(alias.clone()));
    }
}

fn value_token(v: &Value) -> Token {
    match v {
        Value::Null => Token::Null,
        Value::Bool(b) => Token::LitBool(*b),
        Value::Int(n) => Token::LitInt(*n),
        Value::Float(f) => Token::LitFloat(*f),
        Value::Str(s) => Token::LitString(s.clone()),
        Value::Date(n) | Value::Time(n) | Value::Timestamp(n) => Token::LitInt(*n),
    }
}

/// Render a condition tree into WHERE-clause tokens. Unresolved
/// nested-query operands never reach a statement (the planner resolves
/// or drops them first); they render as a tautology defensively.
pub fn condition_tokens(node: &ConditionNode, ts: &mut TokenStream) {
    match node {
        ConditionNode::Leaf(cmp) => comparison_tokens(cmp, ts),
        ConditionNode::Group { junction, children } => {
            ts.push(Token::LParen);
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    ts.space()
                        .push(match junction {
                            Junction::And => Token::And,
                            Junction::Or => Token::Or,
                        })
                        .space();
                }
                condition_tokens(child, ts);
            }
            ts.push(Token::RParen);
        }
    }
}

fn comparison_tokens(cmp: &Comparison, ts: &mut TokenStream) {
    if cmp.negated {
        ts.push(Token::Not).space().push(Token::LParen);
    }
    ts.push(Token::Ident(cmp.column.clone()));
    match (&cmp.op, &cmp.operand) {
        (CompareOp::IsNull, _) => {
            ts.space().push(Token::IsNull);
        }
        (CompareOp::Like, Operand::Value(v)) => {
            ts.space().push(Token::Like).space().push(value_token(v));
        }
        (CompareOp::Between, Operand::Values(vs)) if vs.len() == 2 => {
            ts.space()
                .push(Token::Between)
                .space()
                .push(value_token(&vs[0]))
                .space()
                .push(Token::And)
                .space()
                .push(value_token(&vs[1]));
        }
        (CompareOp::In, Operand::Values(vs)) => {
            in_list_tokens(ts, vs.iter());
        }
        (CompareOp::In, Operand::ValueSet(set)) => {
            in_list_tokens(ts, set.iter());
        }
        (op, Operand::Value(v)) => {
            ts.space().push(compare_token(*op)).space().push(value_token(v));
        }
        (op, Operand::Column(other)) => {
            ts.space()
                .push(compare_token(*op))
                .space()
                .push(Token::Ident(other.clone()));
        }
        _ => {
            ts.push(Token::Space).push(Token::Raw("= ".into())).push(Token::Ident(cmp.column.clone()));
        }
    }
    if cmp.negated {
        ts.push(Token::RParen);
    }
}

fn in_list_tokens<'a>(ts: &mut TokenStream, values: impl Iterator<Item = &'a Value>) {
    ts.space().push(Token::In).space().push(Token::LParen);
    for (i, v) in values.enumerate() {
        if i > 0 {
            ts.comma().space();
        }
        ts.push(value_token(v));
    }
    ts.push(Token::RParen);
}

fn compare_token(op: CompareOp) -> Token {
    match op {
        CompareOp::Eq => Token::Eq,
        CompareOp::Ne => Token::Ne,
        CompareOp::Lt => Token::Lt,
        CompareOp::Le => Token::Lte,
        CompareOp::Gt => Token::Gt,
        CompareOp::Ge => Token::Gte,
        // Structured forms are handled before this point.
        CompareOp::Like | CompareOp::In | CompareOp::Between | CompareOp::IsNull => Token::Eq,
    }
}
