//! SQL tokens - the atomic units of generated statement text.
//!
//! Tokens are dialect-agnostic; serialization maps each one to
//! dialect-specific text. Adding a variant forces every consumer to
//! handle it (exhaustive matching).

use super::dialect::{Dialect, SqlDialect};

/// Every element the statement builder can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // === Keywords ===
    Select,
    From,
    Where,
    And,
    Or,
    Not,
    As,
    GroupBy,
    OrderBy,
    Asc,
    Desc,
    In,
    Between,
    Like,
    IsNull,
    IsNotNull,
    Distinct,
    Null,

    // === Punctuation ===
    Comma,
    Dot,
    Star,
    LParen,
    RParen,

    // === Operators ===
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,

    // === Whitespace ===
    Space,
    Newline,

    // === Dynamic content ===
    /// Simple identifier (table, column, alias).
    Ident(String),
    /// Qualified identifier: schema.table or just table.
    QualifiedIdent {
        schema: Option<String>,
        name: String,
    },
    LitInt(i64),
    LitFloat(f64),
    LitString(String),
    LitBool(bool),
    /// Aggregate/function name, rendered uppercase.
    FunctionName(String),

    /// Raw SQL passed through unescaped. Only for trusted fragments:
    /// hand-authored statements that already passed the round-trip
    /// gate, and expression bodies the planner vetted.
    Raw(String),
}

impl Token {
    /// Serialize this token for the given dialect.
    pub fn serialize(&self, dialect: Dialect) -> String {
        match self {
            Token::Select => "SELECT".into(),
            Token::From => "FROM".into(),
            Token::Where => "WHERE".into(),
            Token::And => "AND".into(),
            Token::Or => "OR".into(),
            Token::Not => "NOT".into(),
            Token::As => "AS".into(),
            Token::GroupBy => "GROUP BY".into(),
            Token::OrderBy => "ORDER BY".into(),
            Token::Asc => "ASC".into(),
            Token::Desc => "DESC".into(),
            Token::In => "IN".into(),
            Token::Between => "BETWEEN".into(),
            Token::Like => "LIKE".into(),
            Token::IsNull => "IS NULL".into(),
            Token::IsNotNull => "IS NOT NULL".into(),
            Token::Distinct => "DISTINCT".into(),
            Token::Null => "NULL".into(),

            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
            Token::Star => "*".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),

            Token::Eq => "=".into(),
            Token::Ne => "<>".into(),
            Token::Lt => "<".into(),
            Token::Gt => ">".into(),
            Token::Lte => "<=".into(),
            Token::Gte => ">=".into(),

            Token::Space => " ".into(),
            Token::Newline => "\n".into(),

            Token::Ident(name) => dialect.quote_identifier(name),
            Token::QualifiedIdent { schema, name } => match schema {
                Some(s) => format!(
                    "{}.{}",
                    dialect.quote_identifier(s),
                    dialect.quote_identifier(name)
                ),
                None => dialect.quote_identifier(name),
            },
            Token::LitInt(n) => n.to_string(),
            Token::LitFloat(f) => f.to_string(),
            Token::LitString(s) => dialect.quote_string(s),
            Token::LitBool(b) => dialect.format_bool(*b).into(),
            Token::FunctionName(name) => name.to_uppercase(),
            Token::Raw(s) => s.clone(),
        }
    }
}

/// A stream of tokens that serializes to SQL text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self { tokens: vec![] }
    }

    pub fn push(&mut self, token: Token) -> &mut Self {
        self.tokens.push(token);
        self
    }

    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) -> &mut Self {
        self.tokens.extend(tokens);
        self
    }

    pub fn append(&mut self, other: &TokenStream) -> &mut Self {
        self.tokens.extend(other.tokens.iter().cloned());
        self
    }

    pub fn space(&mut self) -> &mut Self {
        self.push(Token::Space)
    }

    pub fn comma(&mut self) -> &mut Self {
        self.push(Token::Comma)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Serialize all tokens to SQL text.
    pub fn serialize(&self, dialect: Dialect) -> String {
        self.tokens.iter().map(|t| t.serialize(dialect)).collect()
    }
}
