pub mod collection;
pub mod session;

pub use collection::*;
pub use session::*;

use serde_json::Value;
use uuid::Uuid;

use crate::{
    key::{Key, TypeCertainty},
    schema::{RelationId, TypeId},
};

/// Identifies one lifetime of a session cache. Handles created under a
/// token stay meaningful only while the cache still reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LifetimeToken(Uuid);

impl LifetimeToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LifetimeToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Loaded state of one object. Column slots follow the layout of `type_id`;
/// `None` marks a column that has not been fetched yet.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub type_id: TypeId,
    pub certainty: TypeCertainty,
    values: Vec<Option<Value>>,
}

impl EntityState {
    pub fn new(type_id: TypeId, certainty: TypeCertainty, width: usize) -> Self {
        Self {
            type_id,
            certainty,
            values: vec![None; width],
        }
    }

    pub fn is_loaded(&self, column: usize) -> bool {
        matches!(self.values.get(column), Some(Some(_)))
    }

    /// `None` when the column is not loaded; `Some(Value::Null)` when it is
    /// loaded and null.
    pub fn value(&self, column: usize) -> Option<&Value> {
        self.values.get(column).and_then(Option::as_ref)
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn widen(&mut self, width: usize) {
        if self.values.len() < width {
            self.values.resize(width, None);
        }
    }

    pub(crate) fn set(&mut self, column: usize, value: Value) {
        if column >= self.values.len() {
            self.widen(column + 1);
        }
        self.values[column] = Some(value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedEntry {
    Present(EntityState),
    /// Confirmed absent: removed locally or not found by an exact fetch.
    Removed,
}

impl CachedEntry {
    pub fn as_present(&self) -> Option<&EntityState> {
        match self {
            CachedEntry::Present(state) => Some(state),
            CachedEntry::Removed => None,
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, CachedEntry::Removed)
    }
}

/// Column values parsed out of one fetched row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub type_id: TypeId,
    pub certainty: TypeCertainty,
    pub values: Vec<(usize, Value)>,
}

/// -----------------------------
/// Session cache contract
/// -----------------------------

/// Session-local object cache. It is the single source of truth for what is
/// already known and what still needs fetching.
pub trait ObjectCache: Send {
    fn lookup(&self, key: &Key) -> Option<&CachedEntry>;

    /// Merge fetched columns into the cached state of `key`.
    fn update(&mut self, key: Key, update: RowUpdate);

    /// Record `key` as confirmed absent.
    fn mark_removed(&mut self, key: Key);

    fn collection(&self, owner: &Key, relation: RelationId) -> Option<&CollectionState>;

    /// Cross-pass collection state of `(owner, relation)`, created empty on
    /// first access.
    fn collection_mut(&mut self, owner: &Key, relation: RelationId) -> &mut CollectionState;

    fn lifetime_token(&self) -> LifetimeToken;
}
