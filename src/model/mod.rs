//! Logical query model: assemblies, columns, conditions, values.

mod assembly;
mod column;
mod condition;
mod types;

pub use assembly::{
    AggregateFormula, AggregateRef, AggregateSpec, AssemblyKind, ConcatOp, CubeType, EmbeddedData,
    RankingSpec, SortKey, SortSpec, SourceInfo, TableAssembly,
};
pub use column::{ColumnRef, ColumnSelection, RefKind};
pub use condition::{CompareOp, Comparison, ConditionNode, Junction, Operand, SubQueryRef};
pub use types::{DataType, ExecMode, Value};
