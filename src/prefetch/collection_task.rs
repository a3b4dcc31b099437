use std::sync::Arc;

use crate::{
    adapters::{
        FetchPlan, PlanRequest, RawRow, ResultShape, RowMaterializer, Statement, StatementParams,
    },
    cache::{ObjectCache, RowUpdate},
    error::Error,
    key::Key,
    schema::{ColumnSet, RelationId, TypeId},
};

/// Pending fetch of one owner's related collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionTask {
    pub owner: Key,
    pub relation: RelationId,
    pub target: TypeId,
    pub item_limit: Option<usize>,
    /// Columns loaded for every fetched item.
    pub columns: ColumnSet,
}

impl CollectionTask {
    pub fn new(
        owner: Key,
        relation: RelationId,
        target: TypeId,
        item_limit: Option<usize>,
        columns: ColumnSet,
    ) -> Self {
        Self {
            owner,
            relation,
            target,
            item_limit,
            columns,
        }
    }

    /// Merge another request for the same `(owner, relation)`. The more
    /// permissive limit wins: no limit beats any limit, otherwise the larger
    /// one is kept. Returns whether the task changed.
    pub fn merge(&mut self, item_limit: Option<usize>, columns: &ColumnSet) -> bool {
        let merged = match (self.item_limit, item_limit) {
            (None, _) | (_, None) => None,
            (Some(current), Some(requested)) => Some(current.max(requested)),
        };
        let width = self.columns.len();
        self.columns.extend(columns.iter());
        let changed = merged != self.item_limit || width != self.columns.len();
        self.item_limit = merged;
        changed
    }

    pub fn plan_request(&self) -> PlanRequest {
        PlanRequest::collection(self.target, self.relation, self.columns.clone())
    }

    pub fn statement(&self, plan: Arc<FetchPlan>) -> Statement {
        Statement {
            plan,
            params: StatementParams::Collection {
                owner: self.owner.clone(),
                limit: self.item_limit,
            },
        }
    }

    /// Item count implied by a result of `returned` rows: known when the
    /// limit did not cut the answer short.
    pub fn total_for(&self, returned: usize) -> Option<usize> {
        match self.item_limit {
            Some(limit) if returned >= limit => None,
            _ => Some(returned),
        }
    }

    /// Cache the fetched items and record the collection membership.
    pub fn reconcile<C: ObjectCache + ?Sized>(
        &self,
        shape: &ResultShape,
        rows: &[RawRow],
        materializer: &dyn RowMaterializer,
        cache: &mut C,
    ) -> Result<usize, Error> {
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed = materializer.materialize(shape, row)?;
            keys.push(parsed.key.clone());
            cache.update(
                parsed.key,
                RowUpdate {
                    type_id: parsed.type_id,
                    certainty: parsed.certainty,
                    values: parsed.values,
                },
            );
        }
        let total = self.total_for(keys.len());
        let count = keys.len();
        cache
            .collection_mut(&self.owner, self.relation)
            .update(keys, total);
        Ok(count)
    }
}
