use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use metrics::counter;

use crate::{
    adapters::{
        FetchPlan, PlanCompiler, PlanRequest, RawRow, RowMaterializer, Statement, StatementParams,
    },
    cache::{CachedEntry, ObjectCache, RowUpdate},
    error::Error,
    key::Key,
    prefetch::plans::PlanCache,
    schema::{ColumnSet, Schema, TypeId},
};

/// Identity of a fetch group: target type plus the sorted column set, with
/// its hash computed once.
#[derive(Debug, Clone)]
pub struct GroupKey {
    type_id: TypeId,
    columns: ColumnSet,
    hash: u64,
}

impl GroupKey {
    pub fn new(type_id: TypeId, columns: ColumnSet) -> Self {
        let hash = PlanRequest::key_batch(type_id, columns.clone())
            .fingerprint()
            .short();
        Self {
            type_id,
            columns,
            hash,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.type_id == other.type_id && self.columns == other.columns
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub found: usize,
    pub absent: usize,
}

/// Identities that need the same columns of the same type, fetched together
/// in bounded chunks.
#[derive(Debug)]
pub struct FetchGroup {
    key: GroupKey,
    entries: Vec<(Key, bool)>,
    registered: HashSet<Key>,
    plan: Option<Arc<FetchPlan>>,
    sub_requests: usize,
}

impl FetchGroup {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            registered: HashSet::new(),
            plan: None,
            sub_requests: 0,
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `key`. The first registration of an identity wins; later
    /// ones are ignored and return `false`.
    pub fn add(&mut self, key: Key, exact: bool) -> bool {
        if !self.registered.insert(key.clone()) {
            return false;
        }
        self.entries.push((key, exact));
        true
    }

    pub fn sub_requests(&self) -> usize {
        self.sub_requests
    }

    /// Append one statement per chunk of at most `max_keys` identities.
    pub fn register_sub_requests(
        &mut self,
        plans: &mut PlanCache,
        compiler: &dyn PlanCompiler,
        max_keys: usize,
        statements: &mut Vec<Statement>,
    ) -> Result<usize, Error> {
        let plan = plans.get_or_compile(
            PlanRequest::key_batch(self.key.type_id, self.key.columns.clone()),
            compiler,
        )?;
        let before = statements.len();
        for chunk in self.entries.chunks(max_keys.max(1)) {
            tracing::trace!(
                target_type = %self.key.type_id,
                keys = chunk.len(),
                "fetch group sub-request"
            );
            statements.push(Statement {
                plan: Arc::clone(&plan),
                params: StatementParams::Keys(chunk.iter().map(|(k, _)| k.clone()).collect()),
            });
        }
        self.plan = Some(plan);
        self.sub_requests = statements.len() - before;
        Ok(self.sub_requests)
    }

    /// Apply the rows of every sub-request to the cache. Identities that
    /// came back in no chunk are recorded as absent when their exact type
    /// was required, unless that would overwrite a removal or a more
    /// specific exact state.
    pub fn reconcile<C: ObjectCache + ?Sized>(
        &self,
        results: &[Vec<RawRow>],
        materializer: &dyn RowMaterializer,
        schema: &Schema,
        cache: &mut C,
    ) -> Result<ReconcileOutcome, Error> {
        let plan = self.plan.as_ref().ok_or(Error::InvalidState(
            "fetch group reconciled before its sub-requests were registered",
        ))?;

        let mut found = HashSet::new();
        for row in results.iter().flatten() {
            let parsed = materializer.materialize(&plan.shape, row)?;
            found.insert(parsed.key.clone());
            cache.update(
                parsed.key,
                RowUpdate {
                    type_id: parsed.type_id,
                    certainty: parsed.certainty,
                    values: parsed.values,
                },
            );
        }

        let mut absent = 0;
        for (key, exact) in &self.entries {
            if !*exact || found.contains(key) {
                continue;
            }
            match cache.lookup(key) {
                Some(CachedEntry::Removed) => continue,
                Some(CachedEntry::Present(state))
                    if state.certainty.is_exact()
                        && schema.is_subtype(state.type_id, self.key.type_id) =>
                {
                    continue;
                }
                _ => {}
            }
            tracing::debug!(
                key = %key,
                target_type = %self.key.type_id,
                "caching confirmed absence"
            );
            cache.mark_removed(key.clone());
            absent += 1;
        }
        if absent > 0 {
            counter!("prefetch.absent.total").increment(absent as u64);
        }

        Ok(ReconcileOutcome {
            found: found.len(),
            absent,
        })
    }
}
