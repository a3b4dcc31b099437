use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::mem;

use crate::{
    cache::{CachedEntry, EntityState, ObjectCache},
    error::Error,
    key::Key,
    prefetch::{collection_task::CollectionTask, descriptor::RelationDescriptor},
    schema::{ColumnSet, RelationId, RelationKind, Schema, TypeId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Has work that the next flush phase must fetch.
    Pending,
    /// Own row and collections fetched; deferred relations not yet resolved.
    FirstPassDone,
    Resolved,
}

/// Arena key of a graph node: identity plus the type it is planned as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub key: Key,
    pub type_id: TypeId,
}

/// A reference whose foreign key is fetched together with the owner row.
#[derive(Debug, Clone)]
struct Placeholder {
    target: TypeId,
    columns: Vec<usize>,
    lazy: bool,
}

/// Follow-up request for another (or the same) identity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeRequest {
    pub key: Key,
    pub declared: TypeId,
    pub relations: Vec<RelationDescriptor>,
    /// `Some(include_lazy)` when the default relations of the resolved type
    /// are requested as well.
    pub defaults: Option<bool>,
}

impl NodeRequest {
    pub fn new(key: Key, declared: TypeId, relations: Vec<RelationDescriptor>) -> Self {
        Self {
            key,
            declared,
            relations,
            defaults: None,
        }
    }

    pub fn defaults(key: Key, declared: TypeId, include_lazy: bool) -> Self {
        Self {
            key,
            declared,
            relations: Vec::new(),
            defaults: Some(include_lazy),
        }
    }
}

enum ForeignKey {
    Unloaded,
    Null,
    Key(Key),
}

fn foreign_key(
    schema: &Schema,
    target: TypeId,
    owner: Option<&EntityState>,
    columns: &[usize],
) -> Result<ForeignKey, Error> {
    let Some(owner) = owner else {
        return Ok(ForeignKey::Unloaded);
    };
    if !columns.iter().all(|c| owner.is_loaded(*c)) {
        return Ok(ForeignKey::Unloaded);
    }
    let values = columns.iter().filter_map(|c| owner.value(*c));
    Ok(schema
        .decode_key(target, values)?
        .map_or(ForeignKey::Null, ForeignKey::Key))
}

/// Prefetch plan of one object within a pass.
#[derive(Debug)]
pub struct GraphNode {
    key: Key,
    type_id: TypeId,
    exact: bool,
    state: NodeState,
    root: Option<ColumnSet>,
    references: BTreeMap<RelationId, Key>,
    placeholders: BTreeMap<RelationId, Placeholder>,
    collections: BTreeMap<RelationId, CollectionTask>,
    awaiting_type: Vec<RelationDescriptor>,
    defaults: Option<bool>,
}

impl GraphNode {
    pub fn new(key: Key, type_id: TypeId, exact: bool) -> Self {
        Self {
            key,
            type_id,
            exact,
            state: NodeState::Pending,
            root: None,
            references: BTreeMap::new(),
            placeholders: BTreeMap::new(),
            collections: BTreeMap::new(),
            awaiting_type: Vec::new(),
            defaults: None,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Columns still to be fetched on the object's own row.
    pub fn root_columns(&self) -> Option<&ColumnSet> {
        self.root.as_ref()
    }

    pub fn collection_tasks(&self) -> impl Iterator<Item = &CollectionTask> {
        self.collections.values()
    }

    /// Target identity of a reference resolved so far.
    pub fn reference(&self, relation: RelationId) -> Option<&Key> {
        self.references.get(&relation)
    }

    pub fn has_placeholder(&self, relation: RelationId) -> bool {
        self.placeholders.contains_key(&relation)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.root.is_none()
            && self.collections.is_empty()
            && self.placeholders.is_empty()
            && self.awaiting_type.is_empty()
    }

    pub(crate) fn request_defaults(&mut self, include_lazy: bool) {
        self.defaults = Some(self.defaults.unwrap_or(false) || include_lazy);
    }

    /// Fetch the default columns of the planned type so that the concrete
    /// type of the object is learned.
    pub(crate) fn probe(&mut self, schema: &Schema) -> Result<(), Error> {
        let columns = schema.default_columns(self.type_id, false)?;
        self.root
            .get_or_insert_with(ColumnSet::new)
            .extend(columns.iter());
        Ok(())
    }

    /// Classify one requested relation against the cached owner row.
    /// Follow-up requests for other identities are pushed to `spawned`.
    /// Returns whether the node gained work.
    pub(crate) fn classify<C: ObjectCache + ?Sized>(
        &mut self,
        descriptor: &RelationDescriptor,
        schema: &Schema,
        cache: &C,
        spawned: &mut Vec<NodeRequest>,
    ) -> Result<bool, Error> {
        let relation = schema.relation(descriptor.relation)?;
        if !schema.is_assignable(self.type_id, relation.owner) {
            if !self.exact && schema.may_be_assignable(self.type_id, relation.owner) {
                if self.awaiting_type.contains(descriptor) {
                    return Ok(false);
                }
                self.awaiting_type.push(*descriptor);
                return Ok(true);
            }
            return Err(Error::InvalidArgument(format!(
                "relation {} is not declared on {}",
                relation.name, self.type_id
            )));
        }

        let owner = cache.lookup(&self.key).and_then(CachedEntry::as_present);
        match &relation.kind {
            RelationKind::Column { column } => {
                if owner.is_some_and(|s| s.is_loaded(*column)) {
                    Ok(false)
                } else {
                    Ok(self.add_root_columns([*column]))
                }
            }
            RelationKind::Reference { target, columns } => {
                match foreign_key(schema, *target, owner, columns)? {
                    ForeignKey::Key(key) => {
                        if descriptor.fetch_fields {
                            self.references.insert(relation.id, key.clone());
                            spawned.push(NodeRequest::defaults(
                                key,
                                *target,
                                descriptor.fetch_lazy_fields,
                            ));
                        }
                        Ok(false)
                    }
                    ForeignKey::Null => Ok(false),
                    ForeignKey::Unloaded => {
                        let mut added = self.add_root_columns(columns.iter().copied());
                        if descriptor.fetch_fields
                            && !self.placeholders.contains_key(&relation.id)
                        {
                            self.placeholders.insert(
                                relation.id,
                                Placeholder {
                                    target: *target,
                                    columns: columns.clone(),
                                    lazy: descriptor.fetch_lazy_fields,
                                },
                            );
                            added = true;
                        }
                        Ok(added)
                    }
                }
            }
            RelationKind::Collection { target } => {
                if let Some(state) = cache.collection(&self.key, relation.id) {
                    let enough = descriptor
                        .item_limit
                        .is_some_and(|limit| state.confirmed_count() >= limit);
                    if state.is_fully_loaded() || enough {
                        return Ok(false);
                    }
                }
                let columns = if descriptor.fetch_fields {
                    schema.default_columns(*target, descriptor.fetch_lazy_fields)?
                } else {
                    ColumnSet::new()
                };
                match self.collections.entry(relation.id) {
                    Entry::Occupied(mut task) => {
                        Ok(task.get_mut().merge(descriptor.item_limit, &columns))
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(CollectionTask::new(
                            self.key.clone(),
                            relation.id,
                            *target,
                            descriptor.item_limit,
                            columns,
                        ));
                        Ok(true)
                    }
                }
            }
        }
    }

    pub(crate) fn take_fetch(&mut self) -> Option<ColumnSet> {
        self.root.take()
    }

    pub(crate) fn take_collections(&mut self) -> Vec<CollectionTask> {
        mem::take(&mut self.collections).into_values().collect()
    }

    pub(crate) fn reopen(&mut self) {
        self.state = NodeState::Pending;
    }

    pub(crate) fn complete_first_pass(&mut self) -> Result<(), Error> {
        if self.state != NodeState::Pending {
            return Err(Error::InvalidState(
                "graph node completed a first pass it was not pending for",
            ));
        }
        self.state = NodeState::FirstPassDone;
        Ok(())
    }

    /// Second phase: turn deferred references into requests for their
    /// targets and re-plan relations that waited for the concrete type.
    pub(crate) fn resolve<C: ObjectCache + ?Sized>(
        &mut self,
        schema: &Schema,
        cache: &C,
    ) -> Result<Vec<NodeRequest>, Error> {
        if self.state != NodeState::FirstPassDone {
            return Err(Error::InvalidState(
                "graph node resolved before its first pass completed",
            ));
        }
        self.state = NodeState::Resolved;

        let owner = cache.lookup(&self.key).and_then(CachedEntry::as_present);
        let mut spawned = Vec::new();

        for (relation, placeholder) in mem::take(&mut self.placeholders) {
            // a null or missing foreign key means the reference is empty
            let target = foreign_key(schema, placeholder.target, owner, &placeholder.columns)?;
            if let ForeignKey::Key(key) = target {
                tracing::trace!(
                    owner = %self.key,
                    %relation,
                    target = %key,
                    "resolved deferred reference"
                );
                self.references.insert(relation, key.clone());
                spawned.push(NodeRequest::defaults(key, placeholder.target, placeholder.lazy));
            }
        }

        if !self.exact {
            let awaiting = mem::take(&mut self.awaiting_type);
            if let Some(state) =
                owner.filter(|s| s.certainty.is_exact() && s.type_id != self.type_id)
            {
                let relations: Vec<RelationDescriptor> = awaiting
                    .into_iter()
                    .filter(|d| {
                        schema
                            .relation(d.relation)
                            .is_ok_and(|r| schema.is_assignable(state.type_id, r.owner))
                    })
                    .collect();
                if !relations.is_empty() || self.defaults.is_some() {
                    spawned.push(NodeRequest {
                        key: self.key.clone(),
                        declared: state.type_id,
                        relations,
                        defaults: self.defaults,
                    });
                }
            }
        }

        Ok(spawned)
    }

    fn add_root_columns(&mut self, columns: impl IntoIterator<Item = usize>) -> bool {
        let root = self.root.get_or_insert_with(ColumnSet::new);
        let before = root.len();
        root.extend(columns);
        root.len() != before
    }
}
