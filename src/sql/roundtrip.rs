//! Legality gate for hand-authored statements.
//!
//! A user-edited SQL block may only participate in merging when it
//! round-trips through the parser losslessly: parse success, the
//! re-rendered text parses back to the same tree, and the projection
//! is explicit and non-empty. Anything else pushes the whole node to
//! local post-processing.

use sqlparser::ast::{self, SetExpr, Statement as Ast};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// What the gate learned about a parseable statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUserSql {
    /// Output column names of the projection, in order.
    pub projection: Vec<String>,
}

/// Run the round-trip gate. `None` means "not mergeable".
pub fn parse_user_sql(text: &str) -> Option<ParsedUserSql> {
    let dialect = GenericDialect {};
    let parsed = match Parser::parse_sql(&dialect, text) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "hand-authored statement failed to parse");
            return None;
        }
    };
    if parsed.len() != 1 {
        return None;
    }
    let query = match &parsed[0] {
        Ast::Query(q) => q,
        _ => return None,
    };

    // Lossless check: the re-rendered text must parse back to the same
    // tree. A mismatch means the parser dropped or normalized away
    // information we would then regenerate incorrectly.
    let rendered = parsed[0].to_string();
    match Parser::parse_sql(&dialect, &rendered) {
        Ok(reparsed) if reparsed == parsed => {}
        _ => {
            debug!("hand-authored statement does not round-trip losslessly");
            return None;
        }
    }

    let projection = explicit_projection(&query.body)?;
    if projection.is_empty() {
        return None;
    }
    Some(ParsedUserSql { projection })
}

/// Explicit output names of the query body. Wildcards yield no names,
/// which fails the non-empty requirement downstream.
fn explicit_projection(body: &SetExpr) -> Option<Vec<String>> {
    let select = match body {
        SetExpr::Select(s) => s,
        // Set operations keep the left side's projection.
        SetExpr::SetOperation { left, .. } => return explicit_projection(left),
        _ => return None,
    };
    let mut out = Vec::new();
    for item in &select.projection {
        match item {
            ast::SelectItem::UnnamedExpr(expr) => match expr_name(expr) {
                Some(name) => out.push(name),
                None => return Some(Vec::new()),
            },
            ast::SelectItem::ExprWithAlias { alias, .. } => out.push(alias.value.clone()),
            ast::SelectItem::Wildcard(_) | ast::SelectItem::QualifiedWildcard(..) => {
                return Some(Vec::new());
            }
        }
    }
    Some(out)
}

fn expr_name(expr: &ast::Expr) -> Option<String> {
    match expr {
        ast::Expr::Identifier(id) => Some(id.value.clone()),
        ast::Expr::CompoundIdentifier(parts) => parts.last().map(|id| id.value.clone()),
        _ => None,
    }
}
