//! Statement construction: tokens, dialects, the executable statement
//! and the hand-authored-SQL legality gate.

pub mod dialect;
pub mod roundtrip;
pub mod statement;
pub mod token;

pub use dialect::{Ansi, Dialect, Postgres, SqlDialect, TSql};
pub use roundtrip::{parse_user_sql, ParsedUserSql};
pub use statement::{SelectItem, SqlError, SqlResult, Statement, StatementTable};
pub use token::{Token, TokenStream};
