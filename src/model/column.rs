//! Logical column references and column selections.
//!
//! A `ColumnRef` identifies a column by (entity, attribute) or by an
//! expression body. Identity questions (which physical column does this
//! logical name mean, after aliasing and expression indirection) are
//! answered by the resolver, not here.

use serde::{Deserialize, Serialize};

use super::types::DataType;

/// How a column reference is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKind {
    /// Plain (entity, attribute) reference.
    Plain,
    /// Scripted expression over other columns in the same selection.
    Expression,
    /// Cube dimension level.
    CubeDimension,
    /// Cube measure.
    CubeMeasure,
    /// Aggregate output column.
    Aggregate,
    /// Calculated column appended after execution.
    Calculated,
}

/// A logical column reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Entity (table) qualifier. Empty for unqualified references.
    pub entity: Option<String>,

    /// Attribute name within the entity.
    pub attribute: String,

    /// Expression body for `RefKind::Expression` columns; addresses
    /// sibling columns as `field['name']`.
    pub expression: Option<String>,

    /// Output alias, when the caller renamed the column.
    pub alias: Option<String>,

    pub kind: RefKind,

    pub data_type: DataType,

    /// Hidden columns participate in conditions/sorts but are not
    /// part of the visible output.
    pub visible: bool,
}

impl ColumnRef {
    pub fn new(entity: Option<&str>, attribute: &str, data_type: DataType) -> Self {
        Self {
            entity: entity.map(|e| e.to_string()),
            attribute: attribute.to_string(),
            expression: None,
            alias: None,
            kind: RefKind::Plain,
            data_type,
            visible: true,
        }
    }

    /// An expression column. The attribute doubles as the output name.
    pub fn expression(name: &str, body: &str, data_type: DataType) -> Self {
        Self {
            entity: None,
            attribute: name.to_string(),
            expression: Some(body.to_string()),
            alias: None,
            kind: RefKind::Expression,
            data_type,
            visible: true,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn with_kind(mut self, kind: RefKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// The name this column is known by in the output: alias when set,
    /// attribute otherwise.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.attribute)
    }

    /// Fully qualified `entity.attribute` form, for diagnostics and keys.
    pub fn qualified_name(&self) -> String {
        match &self.entity {
            Some(e) => format!("{}.{}", e, self.attribute),
            None => self.attribute.clone(),
        }
    }

    /// Same underlying column: entity, attribute and expression agree.
    /// Alias and visibility are presentation, not identity.
    pub fn same_column(&self, other: &ColumnRef) -> bool {
        self.entity == other.entity
            && self.attribute == other.attribute
            && self.expression == other.expression
    }
}

/// An ordered set of logical columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSelection {
    pub columns: Vec<ColumnRef>,
}

impl ColumnSelection {
    pub fn new(columns: Vec<ColumnRef>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ColumnRef> {
        self.columns.iter()
    }

    /// Index of the column with the given output name.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.output_name() == name)
    }

    /// Output names in column order.
    pub fn output_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.output_name().to_string())
            .collect()
    }

    /// Whether any column carries an output alias.
    pub fn has_aliases(&self) -> bool {
        self.columns.iter().any(|c| c.alias.is_some())
    }

    /// Whether any column is an expression.
    pub fn has_expressions(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.kind == RefKind::Expression)
    }

    /// Output names must be unique after alias resolution.
    pub fn validate_unique_names(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.output_name()) {
                return Err(format!("duplicate column name '{}'", col.output_name()));
            }
        }
        Ok(())
    }
}
