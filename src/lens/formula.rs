//! Scripted formula columns.
//!
//! Each formula appends one column, evaluated per row in an embedded
//! Lua environment. The current row is exposed as the `field` table, so
//! a body reads like `field['price'] * field['qty']`.
//!
//! A formula that is provably a pure alias of an existing column (the
//! body is exactly one field reference, and the declared type matches
//! the base column's type) is compiled to a plain projection instead of
//! entering the script environment. Output is identical either way.

use mlua::{Lua, Value as LuaValue};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::model::{DataType, Value};

use super::{row_not_realized, BoxLens, TableLens};

/// Matches a body that is exactly one field reference.
static PURE_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*field\s*\[\s*(?:'([^']+)'|"([^"]+)")\s*\]\s*$"#)
        .expect("pure alias pattern")
});

/// One computed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaColumn {
    pub name: String,
    pub body: String,
    pub data_type: DataType,
}

impl FormulaColumn {
    pub fn new(name: &str, body: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            body: body.to_string(),
            data_type,
        }
    }

    /// The referenced column name when the body is a bare field access.
    pub fn pure_alias_target(&self) -> Option<&str> {
        PURE_ALIAS_RE.captures(&self.body).and_then(|cap| {
            cap.get(1)
                .or_else(|| cap.get(2))
                .map(|m| m.as_str())
        })
    }
}

enum Compiled {
    /// Copy the base column at this index.
    Projection(usize),
    /// Evaluate the body per row.
    Script(String),
}

/// Appends formula columns to the base lens. Values are computed once,
/// while the row is realized, so repeated cell reads are pure.
pub struct FormulaLens {
    base: BoxLens,
    names: Vec<String>,
    compiled: Vec<Compiled>,
    lua: Lua,
    headers: Vec<String>,
    /// Alternate `field` key per base column (the underlying attribute
    /// name when the header shows an alias). Bodies may address a
    /// column by either name.
    alt_names: Vec<Option<String>>,
    /// Computed formula values per realized data row.
    computed: Vec<Vec<Value>>,
    next_base: usize,
    exhausted: bool,
}

impl FormulaLens {
    /// `base_types` carries the declared type per base column when the
    /// caller knows it; unknown types disable the alias fast path for
    /// that column (the script result is then authoritative).
    pub fn new(
        mut base: BoxLens,
        formulas: Vec<FormulaColumn>,
        base_types: &[Option<DataType>],
    ) -> Self {
        let headers: Vec<String> = if base.more_rows(0) {
            (0..base.col_count())
                .map(|c| base.cell(0, c).to_display())
                .collect()
        } else {
            Vec::new()
        };

        let compiled = formulas
            .iter()
            .map(|f| {
                if let Some(target) = f.pure_alias_target() {
                    if let Some(idx) = headers.iter().position(|h| h == target) {
                        let same_type = base_types.get(idx).copied().flatten()
                            == Some(f.data_type);
                        if same_type {
                            return Compiled::Projection(idx);
                        }
                    }
                }
                Compiled::Script(f.body.clone())
            })
            .collect();

        let alt_names = vec![None; headers.len()];
        Self {
            base,
            names: formulas.into_iter().map(|f| f.name).collect(),
            compiled,
            lua: Lua::new(),
            headers,
            alt_names,
            computed: Vec::new(),
            next_base: 1,
            exhausted: false,
        }
    }

    /// Register alternate column names (one per base column, `None`
    /// where header and attribute agree).
    pub fn with_alt_names(mut self, alt_names: Vec<Option<String>>) -> Self {
        self.alt_names = alt_names;
        self.alt_names.resize(self.headers.len(), None);
        self
    }

    fn eval_row(&mut self, base_row: usize) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.compiled.len());
        let mut field_bound = false;
        for c in &self.compiled {
            match c {
                Compiled::Projection(idx) => out.push(self.base.cell(base_row, *idx)),
                Compiled::Script(body) => {
                    if !field_bound {
                        if let Err(e) = self.bind_field(base_row) {
                            warn!(error = %e, "failed to bind formula row scope");
                            out.push(Value::Null);
                            continue;
                        }
                        field_bound = true;
                    }
                    out.push(self.eval_body(body));
                }
            }
        }
        out
    }

    fn bind_field(&self, base_row: usize) -> mlua::Result<()> {
        let field = self.lua.create_table()?;
        for (c, name) in self.headers.iter().enumerate() {
            let cell = self.base.cell(base_row, c);
            Self::set_field(&field, name, &cell)?;
            if let Some(alt) = self.alt_names.get(c).and_then(|a| a.as_deref()) {
                if alt != name {
                    Self::set_field(&field, alt, &cell)?;
                }
            }
        }
        self.lua.globals().set("field", field)
    }

    fn set_field(field: &mlua::Table, name: &str, value: &Value) -> mlua::Result<()> {
        match value {
            Value::Null => field.set(name, LuaValue::Nil),
            Value::Bool(b) => field.set(name, *b),
            Value::Int(n) => field.set(name, *n),
            Value::Float(f) => field.set(name, *f),
            Value::Str(s) => field.set(name, s.as_str()),
            Value::Date(n) | Value::Time(n) | Value::Timestamp(n) => field.set(name, *n),
        }
    }

    fn eval_body(&self, body: &str) -> Value {
        match self.lua.load(body).eval::<LuaValue>() {
            Ok(LuaValue::Nil) => Value::Null,
            Ok(LuaValue::Boolean(b)) => Value::Bool(b),
            Ok(LuaValue::Integer(n)) => Value::Int(n),
            Ok(LuaValue::Number(f)) => Value::Float(f),
            Ok(LuaValue::String(s)) => Value::Str(s.to_string_lossy().to_string()),
            Ok(other) => {
                warn!(kind = %other.type_name(), "formula produced a non-scalar; using null");
                Value::Null
            }
            Err(e) => {
                warn!(error = %e, "formula evaluation failed; using null");
                Value::Null
            }
        }
    }
}

impl TableLens for FormulaLens {
    fn more_rows(&mut self, row: usize) -> bool {
        while self.computed.len() < row {
            if self.exhausted {
                return false;
            }
            if !self.base.more_rows(self.next_base) {
                self.exhausted = true;
                return false;
            }
            let r = self.next_base;
            self.next_base += 1;
            let values = self.eval_row(r);
            self.computed.push(values);
        }
        true
    }

    fn row_count(&self) -> usize {
        self.computed.len() + 1
    }

    fn col_count(&self) -> usize {
        self.base.col_count() + self.names.len()
    }

    fn cell(&self, row: usize, col: usize) -> Value {
        let base_cols = self.base.col_count();
        if row == 0 {
            return if col < base_cols {
                self.base.cell(0, col)
            } else {
                Value::Str(self.names[col - base_cols].clone())
            };
        }
        if col < base_cols {
            return self.base.cell(row, col);
        }
        match self.computed.get(row - 1) {
            Some(values) => values[col - base_cols].clone(),
            None => row_not_realized(row),
        }
    }

    fn dispose(&mut self) {
        self.base.dispose();
    }
}
