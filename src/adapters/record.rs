use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::{
    key::{Key, TypeCertainty},
    schema::{ColumnSet, RelationId, TypeId},
};

/// Where the identities of a plan come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanSource {
    /// A bounded batch of keys supplied as parameters.
    KeyBatch,
    /// Members of `relation` for one owner supplied as a parameter.
    Collection { relation: RelationId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub target: TypeId,
    pub columns: ColumnSet,
    pub source: PlanSource,
}

impl PlanRequest {
    pub fn key_batch(target: TypeId, columns: ColumnSet) -> Self {
        Self {
            target,
            columns,
            source: PlanSource::KeyBatch,
        }
    }

    pub fn collection(target: TypeId, relation: RelationId, columns: ColumnSet) -> Self {
        Self {
            target,
            columns,
            source: PlanSource::Collection { relation },
        }
    }

    /// Stable fingerprint of the request shape, used as the plan cache key.
    pub fn fingerprint(&self) -> PlanId {
        let mut hasher = blake3::Hasher::new();
        match self.source {
            PlanSource::KeyBatch => {
                hasher.update(&[0]);
            }
            PlanSource::Collection { relation } => {
                hasher.update(&[1]);
                hasher.update(&relation.0.to_le_bytes());
            }
        }
        hasher.update(&self.target.0.to_le_bytes());
        for column in self.columns.iter() {
            hasher.update(&(column as u64).to_le_bytes());
        }
        PlanId(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanId(blake3::Hash);

impl PlanId {
    /// First eight bytes of the fingerprint.
    pub fn short(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.short())
    }
}

/// Layout of the rows a plan returns: key values first, then the type
/// discriminator when present, then `columns` in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultShape {
    pub type_id: TypeId,
    pub key_width: usize,
    pub has_discriminator: bool,
    pub columns: Vec<usize>,
}

impl ResultShape {
    pub fn width(&self) -> usize {
        self.key_width + usize::from(self.has_discriminator) + self.columns.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub id: PlanId,
    pub request: PlanRequest,
    pub shape: ResultShape,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementParams {
    Keys(Vec<Key>),
    Collection { owner: Key, limit: Option<usize> },
}

/// One sub-request: a compiled plan bound to its parameters.
#[derive(Debug, Clone)]
pub struct Statement {
    pub plan: Arc<FetchPlan>,
    pub params: StatementParams,
}

impl Statement {
    pub fn key_count(&self) -> usize {
        match &self.params {
            StatementParams::Keys(keys) => keys.len(),
            StatementParams::Collection { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow(pub Vec<Value>);

#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    /// Rows per statement, in statement order.
    pub rows: Vec<Vec<RawRow>>,
    /// Physical round trips spent.
    pub round_trips: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRow {
    pub key: Key,
    pub type_id: TypeId,
    pub certainty: TypeCertainty,
    /// `(column index in the type layout, value)` pairs.
    pub values: Vec<(usize, Value)>,
}
