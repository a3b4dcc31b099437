use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    cache::{CachedEntry, ObjectCache},
    error::Error,
    key::Key,
    prefetch::{
        descriptor::RelationDescriptor,
        group::GroupKey,
        node::{GraphNode, NodeKey, NodeRequest, NodeState},
    },
    schema::{Schema, TypeId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    Pending,
    Completed,
    Discarded,
}

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const DISCARDED: u8 = 2;

/// Outcome of a pass, shared between the pass and the handles it issued.
#[derive(Debug, Clone)]
pub struct PassToken(Arc<AtomicU8>);

impl PassToken {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PENDING)))
    }

    pub(crate) fn completed() -> Self {
        Self(Arc::new(AtomicU8::new(COMPLETED)))
    }

    pub fn status(&self) -> PassStatus {
        match self.0.load(Ordering::Acquire) {
            PENDING => PassStatus::Pending,
            COMPLETED => PassStatus::Completed,
            _ => PassStatus::Discarded,
        }
    }

    /// Settle a pending token; a settled one keeps its outcome.
    fn settle(&self, outcome: u8) {
        let _ = self
            .0
            .compare_exchange(PENDING, outcome, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Graph nodes accumulated between two flushes.
#[derive(Debug)]
pub struct PendingPass {
    nodes: Vec<GraphNode>,
    index: HashMap<NodeKey, usize>,
    classified: HashSet<(NodeKey, RelationDescriptor)>,
    token: PassToken,
}

impl Default for PendingPass {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            classified: HashSet::new(),
            token: PassToken::new(),
        }
    }
}

impl Drop for PendingPass {
    fn drop(&mut self) {
        self.token.settle(DISCARDED);
    }
}

impl PendingPass {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn token(&self) -> PassToken {
        self.token.clone()
    }

    pub(crate) fn complete(&self) {
        self.token.settle(COMPLETED);
    }

    pub fn node(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.index.get(key).map(|i| &self.nodes[*i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> &mut GraphNode {
        &mut self.nodes[index]
    }

    pub(crate) fn pending_indexes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.state() == NodeState::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    /// Distinct fetch groups the pending root fetches would form.
    pub fn fetch_group_count(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|n| {
                n.root_columns()
                    .map(|c| GroupKey::new(n.type_id(), c.clone()))
            })
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn collection_task_count(&self) -> usize {
        self.nodes.iter().map(|n| n.collection_tasks().count()).sum()
    }

    pub(crate) fn get_or_create(&mut self, key: NodeKey, exact: bool) -> (usize, bool) {
        if let Some(index) = self.index.get(&key) {
            return (*index, false);
        }
        let index = self.nodes.len();
        self.nodes
            .push(GraphNode::new(key.key.clone(), key.type_id, exact));
        self.index.insert(key, index);
        (index, true)
    }

    /// Plan `request` and every follow-up it spawns.
    pub(crate) fn request<C: ObjectCache + ?Sized>(
        &mut self,
        request: NodeRequest,
        schema: &Schema,
        cache: &C,
    ) -> Result<(), Error> {
        let mut worklist = vec![request];
        while let Some(next) = worklist.pop() {
            self.plan_node(next, schema, cache, &mut worklist)?;
        }
        Ok(())
    }

    fn plan_node<C: ObjectCache + ?Sized>(
        &mut self,
        request: NodeRequest,
        schema: &Schema,
        cache: &C,
        worklist: &mut Vec<NodeRequest>,
    ) -> Result<(), Error> {
        let Some((type_id, exact)) = planned_type(schema, cache, &request.key, request.declared)?
        else {
            return Ok(());
        };

        let mut relations = match request.defaults {
            Some(include_lazy) => schema
                .default_relations(type_id, include_lazy)?
                .into_iter()
                .map(RelationDescriptor::default_for)
                .collect(),
            None => Vec::new(),
        };
        relations.extend(request.relations);

        let node_key = NodeKey {
            key: request.key,
            type_id,
        };
        let (index, created) = self.get_or_create(node_key.clone(), exact);
        let node = &mut self.nodes[index];
        if let Some(include_lazy) = request.defaults {
            node.request_defaults(include_lazy);
        }

        let mut added = false;
        if created && !exact {
            node.probe(schema)?;
            added = true;
        }
        for descriptor in relations {
            if !self.classified.insert((node_key.clone(), descriptor)) {
                continue;
            }
            added |= node.classify(&descriptor, schema, cache, worklist)?;
        }

        if created && node.is_idle() {
            self.nodes.pop();
            self.index.remove(&node_key);
        } else if added {
            node.reopen();
        }
        Ok(())
    }
}

/// Type a request for `key` is planned as, and whether that type is exact.
/// `None` when the object is known to be absent.
pub(crate) fn planned_type<C: ObjectCache + ?Sized>(
    schema: &Schema,
    cache: &C,
    key: &Key,
    declared: TypeId,
) -> Result<Option<(TypeId, bool)>, Error> {
    let declared = if schema.type_info(declared)?.is_interface {
        key.root()
    } else {
        declared
    };
    Ok(match cache.lookup(key) {
        Some(CachedEntry::Removed) => None,
        Some(CachedEntry::Present(state)) if state.certainty.is_exact() => {
            Some((state.type_id, true))
        }
        Some(CachedEntry::Present(state)) if schema.is_subtype(state.type_id, declared) => {
            Some((state.type_id, schema.is_leaf(state.type_id)))
        }
        _ => Some((declared, schema.is_leaf(declared))),
    })
}
