//! Result fingerprints.
//!
//! A `DataKey` is the canonical identity of a query request: the
//! assembly's merge-relevant state plus bound variables, user,
//! execution mode and row limits, serialized deterministically. Two
//! structurally-equivalent requests must produce the same key; that is
//! the whole cache-hit contract.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::model::{ExecMode, TableAssembly, Value};

/// Serializations at or past this length are compacted.
const COMPACT_THRESHOLD: usize = 2000;

/// Compaction subsamples down to roughly this many characters.
const COMPACT_TARGET: usize = 1500;

/// An opaque, order-stable fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataKey(String);

impl DataKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the fingerprint for a request. Returns `None` when the
    /// assembly cannot produce a stable key: runtime-injected data has
    /// no serializable identity, and neither does a condition holding
    /// a live resolved value set.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        assembly: &TableAssembly,
        variables: &BTreeMap<String, Value>,
        user: &str,
        mode: ExecMode,
        formatted: bool,
        input_max: usize,
        preview_max: usize,
        ignore_filtering: bool,
    ) -> Option<DataKey> {
        if matches!(assembly.kind, crate::model::AssemblyKind::Data) {
            return None;
        }

        let payload = KeyPayload {
            kind: assembly.kind,
            source: &assembly.source,
            selection: &assembly.selection,
            aggregate: &assembly.aggregate,
            sort: &assembly.sort,
            pre_conditions: if ignore_filtering {
                &None
            } else {
                &assembly.pre_conditions
            },
            post_conditions: if ignore_filtering {
                &None
            } else {
                &assembly.post_conditions
            },
            ranking: &assembly.ranking,
            distinct: assembly.distinct,
            max_rows: assembly.max_rows,
            variables,
            user,
            mode,
            formatted,
            input_max,
            preview_max,
        };

        // A live value set in a condition fails serialization; that is
        // exactly the "no stable key" case.
        let serialized = serde_json::to_string(&payload).ok()?;
        Some(DataKey(compact(&serialized)))
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Merge-relevant identity of a request. The assembly's display name
/// is deliberately absent: structurally equal queries share results
/// across assemblies, users permitting.
#[derive(Serialize)]
struct KeyPayload<'a> {
    kind: crate::model::AssemblyKind,
    source: &'a crate::model::SourceInfo,
    selection: &'a crate::model::ColumnSelection,
    aggregate: &'a crate::model::AggregateSpec,
    sort: &'a crate::model::SortSpec,
    pre_conditions: &'a Option<crate::model::ConditionNode>,
    post_conditions: &'a Option<crate::model::ConditionNode>,
    ranking: &'a Option<crate::model::RankingSpec>,
    distinct: bool,
    max_rows: usize,
    variables: &'a BTreeMap<String, Value>,
    user: &'a str,
    mode: ExecMode,
    formatted: bool,
    input_max: usize,
    preview_max: usize,
}

/// Deterministically bound the key length: prefix with the string's
/// hash code, then subsample characters at a fixed stride. The same
/// input always compacts to the same output.
pub fn compact(s: &str) -> String {
    if s.len() < COMPACT_THRESHOLD {
        return s.to_string();
    }
    let stride = std::cmp::max(1, s.len() / COMPACT_TARGET);
    let mut out = string_hash(s).to_string();
    out.push('_');
    out.extend(s.chars().step_by(stride));
    out
}

/// Order-sensitive 64-bit string hash (31-multiplier polynomial).
fn string_hash(s: &str) -> i64 {
    s.chars()
        .fold(0i64, |h, c| h.wrapping_mul(31).wrapping_add(c as i64))
}
