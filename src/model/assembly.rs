//! Table assemblies - nodes in the logical query plan graph.
//!
//! Each assembly describes one operation: a bound table, a hand-authored
//! SQL block, embedded data, a mirror of another assembly, a
//! concatenation, a rotation, a cross-tabulation. The assembly owns its
//! column selection, aggregate/sort specs and condition lists; the merge
//! planner reads all of this and decides what reaches the generated
//! statement.
//!
//! Assemblies are cloned defensively before each execution so that
//! planning can never corrupt the stored definition.

use serde::{Deserialize, Serialize};

use super::column::ColumnSelection;
use super::condition::ConditionNode;
use super::types::Value;

/// Kind of assembly. Closed set: every planner phase matches
/// exhaustively over this, keeping merge legality rules in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssemblyKind {
    /// Bound to a physical table of a data source.
    Bound,
    /// Hand-authored SQL text.
    Sql,
    /// Tabular connector: the source runs its own opaque query.
    Tabular,
    /// Embedded (snapshot) dataset carried in the definition.
    Embedded,
    /// Mirror of another assembly.
    Mirror,
    /// Union-like concatenation of child assemblies.
    Concat,
    /// Rotated (pivoted orientation) view of a child assembly.
    Rotated,
    /// Cross-tabulation of a child assembly.
    CrossTab,
    /// Literal data injected at runtime (not serializable).
    Data,
    /// OLAP cube source.
    Cube,
}

/// Cube backend flavor. Only some flavors accept merged aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CubeType {
    SqlServerAnalysis,
    Essbase,
    Mondrian,
    Sap,
    Other,
}

impl CubeType {
    /// Whether this cube driver can evaluate a merged aggregate clause.
    pub fn supports_merged_aggregate(self) -> bool {
        matches!(
            self,
            CubeType::SqlServerAnalysis | CubeType::Essbase | CubeType::Mondrian | CubeType::Sap
        )
    }
}

/// Embedded dataset: header names plus rows of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Concatenation operator for `AssemblyKind::Concat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcatOp {
    Union,
    UnionAll,
    Intersect,
    Minus,
}

/// Kind-specific source description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceInfo {
    /// Physical table with optional schema/catalog.
    Table {
        source: String,
        table: String,
        schema: Option<String>,
        catalog: Option<String>,
    },
    /// Hand-authored statement text.
    Sql { source: String, text: String },
    /// Tabular connector identified by source prefix.
    Tabular { source: String, query_id: String },
    /// Dataset embedded in the definition.
    Embedded(EmbeddedData),
    /// Name of the mirrored assembly.
    Mirror { base: String },
    /// Child assemblies combined by the operator.
    Concat { children: Vec<String>, op: ConcatOp },
    /// Child assembly to rotate or cross-tabulate.
    Child { base: String },
    /// Runtime-injected data; carries no serializable identity.
    Runtime,
    /// Cube source.
    Cube {
        source: String,
        cube: String,
        cube_type: CubeType,
    },
}

/// Aggregate formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFormula {
    Sum,
    Count,
    DistinctCount,
    Avg,
    Min,
    Max,
    First,
    Last,
}

impl AggregateFormula {
    pub fn sql_name(self) -> &'static str {
        match self {
            AggregateFormula::Sum => "SUM",
            AggregateFormula::Count => "COUNT",
            AggregateFormula::DistinctCount => "COUNT DISTINCT",
            AggregateFormula::Avg => "AVG",
            AggregateFormula::Min => "MIN",
            AggregateFormula::Max => "MAX",
            AggregateFormula::First => "FIRST",
            AggregateFormula::Last => "LAST",
        }
    }
}

/// One aggregate output: formula over a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRef {
    pub column: String,
    pub formula: AggregateFormula,
    pub alias: Option<String>,
}

impl AggregateRef {
    pub fn new(column: &str, formula: AggregateFormula) -> Self {
        Self {
            column: column.to_string(),
            formula,
            alias: None,
        }
    }

    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(a) => a.clone(),
            None => format!("{}({})", self.formula.sql_name(), self.column),
        }
    }
}

/// Grouping plus aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Group columns by output name, in order.
    pub groups: Vec<String>,
    pub aggregates: Vec<AggregateRef>,
}

impl AggregateSpec {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.aggregates.is_empty()
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: true,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: false,
        }
    }
}

/// Ordered sort specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
}

impl SortSpec {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Top/bottom-N ranking over an aggregate column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingSpec {
    pub column: String,
    pub top: bool,
    pub n: usize,
}

/// A node in the logical query plan graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAssembly {
    pub name: String,
    pub kind: AssemblyKind,
    pub source: SourceInfo,
    pub selection: ColumnSelection,
    pub aggregate: AggregateSpec,
    pub sort: SortSpec,

    /// Applied before aggregation (WHERE).
    pub pre_conditions: Option<ConditionNode>,
    /// Applied after aggregation (HAVING-like, evaluated locally).
    pub post_conditions: Option<ConditionNode>,
    pub ranking: Option<RankingSpec>,

    pub distinct: bool,
    /// 0 means unlimited.
    pub max_rows: usize,
}

impl TableAssembly {
    pub fn new(name: &str, kind: AssemblyKind, source: SourceInfo) -> Self {
        Self {
            name: name.to_string(),
            kind,
            source,
            selection: ColumnSelection::default(),
            aggregate: AggregateSpec::default(),
            sort: SortSpec::default(),
            pre_conditions: None,
            post_conditions: None,
            ranking: None,
            distinct: false,
            max_rows: 0,
        }
    }

    /// Bound-table convenience constructor.
    pub fn bound(name: &str, source: &str, table: &str) -> Self {
        Self::new(
            name,
            AssemblyKind::Bound,
            SourceInfo::Table {
                source: source.to_string(),
                table: table.to_string(),
                schema: None,
                catalog: None,
            },
        )
    }

    pub fn with_selection(mut self, selection: ColumnSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Name of the child assembly this one derives from, if any.
    pub fn child_name(&self) -> Option<&str> {
        match &self.source {
            SourceInfo::Mirror { base } | SourceInfo::Child { base } => Some(base),
            _ => None,
        }
    }

    /// Names of all assemblies this one depends on.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = match &self.source {
            SourceInfo::Mirror { base } | SourceInfo::Child { base } => vec![base.clone()],
            SourceInfo::Concat { children, .. } => children.clone(),
            _ => vec![],
        };
        // Nested-query conditions depend on their inner assembly too.
        for cond in [&self.pre_conditions, &self.post_conditions].into_iter().flatten() {
            for cmp in cond.comparisons() {
                if let super::condition::Operand::SubQuery(sq) = &cmp.operand {
                    deps.push(sq.assembly.clone());
                }
            }
        }
        deps
    }
}
