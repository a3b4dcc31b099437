mod collection_task;
mod descriptor;
mod executor;
mod group;
mod node;
mod pass;
mod plans;

pub use collection_task::CollectionTask;
pub use descriptor::RelationDescriptor;
pub use group::{FetchGroup, GroupKey, ReconcileOutcome};
pub use node::{GraphNode, NodeKey, NodeState};
pub use pass::{PassStatus, PassToken, PendingPass};
pub use plans::PlanCache;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};

use crate::{
    adapters::{CommandPipeline, ExecutionMode, PlanCompiler, RowMaterializer, ShapeMaterializer},
    cache::{CachedEntry, EntityState, LifetimeToken, ObjectCache, SessionCache},
    config::PrefetchConfig,
    error::Error,
    key::Key,
    prefetch::{executor::BatchExecutor, node::NodeRequest, pass::planned_type},
    schema::{Schema, TypeId},
};

/// Keeps the outcome of a prefetch observable by the caller.
#[derive(Debug, Clone)]
pub struct PrefetchHandle {
    key: Key,
    lifetime: LifetimeToken,
    pass: PassToken,
}

impl PrefetchHandle {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn lifetime(&self) -> LifetimeToken {
        self.lifetime
    }

    pub fn status(&self) -> PassStatus {
        self.pass.status()
    }
}

/// -----------------------------
/// Prefetch orchestrator
/// -----------------------------

/// Per-session entry point. Accumulates graph nodes into one pending pass
/// and flushes it in batches, eagerly once the pass grows past the
/// configured node ceiling.
pub struct Prefetcher<C: ObjectCache> {
    schema: Arc<Schema>,
    cache: C,
    compiler: Arc<dyn PlanCompiler>,
    pipeline: Arc<dyn CommandPipeline>,
    materializer: Arc<dyn RowMaterializer>,
    config: PrefetchConfig,
    plans: PlanCache,
    pass: PendingPass,
    batches: usize,
}

impl Prefetcher<SessionCache> {
    /// Prefetcher over a fresh session cache sized by `config`.
    pub fn session<A>(
        schema: Arc<Schema>,
        adapter: Arc<A>,
        config: PrefetchConfig,
    ) -> Result<Self, Error>
    where
        A: PlanCompiler + CommandPipeline + 'static,
    {
        config.validate()?;
        let cache = SessionCache::with_config(Arc::clone(&schema), &config);
        Self::with_config(schema, cache, adapter, config)
    }
}

impl<C: ObjectCache> Prefetcher<C> {
    pub fn new<A>(schema: Arc<Schema>, cache: C, adapter: Arc<A>) -> Self
    where
        A: PlanCompiler + CommandPipeline + 'static,
    {
        Self {
            materializer: Arc::new(ShapeMaterializer::new(Arc::clone(&schema))),
            schema,
            cache,
            compiler: adapter.clone(),
            pipeline: adapter,
            config: PrefetchConfig::default(),
            plans: PlanCache::new(),
            pass: PendingPass::default(),
            batches: 0,
        }
    }

    pub fn with_config<A>(
        schema: Arc<Schema>,
        cache: C,
        adapter: Arc<A>,
        config: PrefetchConfig,
    ) -> Result<Self, Error>
    where
        A: PlanCompiler + CommandPipeline + 'static,
    {
        config.validate()?;
        let mut prefetcher = Self::new(schema, cache, adapter);
        prefetcher.config = config;
        Ok(prefetcher)
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn RowMaterializer>) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    /// Schedule `relations` of the object identified by `key`, optionally
    /// seen through `declared`.
    pub async fn prefetch_async(
        &mut self,
        key: &Key,
        declared: Option<TypeId>,
        relations: &[RelationDescriptor],
    ) -> Result<PrefetchHandle, Error> {
        self.prefetch_with(key, declared, relations, ExecutionMode::Suspendable)
            .await
    }

    /// Blocking form of [`Prefetcher::prefetch_async`].
    pub fn prefetch(
        &mut self,
        key: &Key,
        declared: Option<TypeId>,
        relations: &[RelationDescriptor],
    ) -> Result<PrefetchHandle, Error> {
        futures::executor::block_on(self.prefetch_with(
            key,
            declared,
            relations,
            ExecutionMode::Blocking,
        ))
    }

    /// Flush the pending pass. Returns the round trips it took. The pass is
    /// discarded whether or not the flush succeeds.
    pub async fn execute_tasks_async(&mut self) -> Result<usize, Error> {
        self.flush(ExecutionMode::Suspendable).await
    }

    /// Blocking form of [`Prefetcher::execute_tasks_async`].
    pub fn execute_tasks(&mut self) -> Result<usize, Error> {
        futures::executor::block_on(self.flush(ExecutionMode::Blocking))
    }

    /// Cached state behind a handle, while the cache lifetime it was issued
    /// under is still current.
    pub fn entity(&self, handle: &PrefetchHandle) -> Option<&EntityState> {
        if handle.lifetime != self.cache.lifetime_token() {
            return None;
        }
        self.cache
            .lookup(&handle.key)
            .and_then(CachedEntry::as_present)
    }

    pub fn pending_nodes(&self) -> usize {
        self.pass.len()
    }

    pub fn pending_fetch_groups(&self) -> usize {
        self.pass.fetch_group_count()
    }

    pub fn pending_collection_tasks(&self) -> usize {
        self.pass.collection_task_count()
    }

    pub fn pending_pass(&self) -> &PendingPass {
        &self.pass
    }

    /// Round trips executed by all flushes so far.
    pub fn batches_executed(&self) -> usize {
        self.batches
    }

    pub fn compiled_plans(&self) -> usize {
        self.plans.len()
    }

    async fn prefetch_with(
        &mut self,
        key: &Key,
        declared: Option<TypeId>,
        relations: &[RelationDescriptor],
        mode: ExecutionMode,
    ) -> Result<PrefetchHandle, Error> {
        let lifetime = self.cache.lifetime_token();
        let Some(request) = self.validate(key, declared, relations)? else {
            return Ok(PrefetchHandle {
                key: key.clone(),
                lifetime,
                pass: PassToken::completed(),
            });
        };

        self.pass.request(request, &self.schema, &self.cache)?;
        let handle = PrefetchHandle {
            key: key.clone(),
            lifetime,
            pass: self.pass.token(),
        };

        if self.pass.len() >= self.config.max_pending_nodes {
            tracing::debug!(
                nodes = self.pass.len(),
                limit = self.config.max_pending_nodes,
                "pending pass reached its node ceiling, flushing"
            );
            self.flush(mode).await?;
        }
        Ok(handle)
    }

    /// Argument checks done before anything is planned. `None` when the
    /// object is known to be absent and there is nothing to do.
    fn validate(
        &self,
        key: &Key,
        declared: Option<TypeId>,
        relations: &[RelationDescriptor],
    ) -> Result<Option<NodeRequest>, Error> {
        let root = self.schema.type_info(key.root())?;
        if root.base.is_some() || root.is_interface {
            return Err(Error::InvalidArgument(format!(
                "key {} is not rooted at a hierarchy root",
                key
            )));
        }
        if key.values().len() != root.key_width {
            return Err(Error::InvalidArgument(format!(
                "key {} has {} values, {} expects {}",
                key,
                key.values().len(),
                root.name,
                root.key_width
            )));
        }
        if key.values().iter().zip(&root.key_kinds).any(|(v, k)| v.kind() != *k) {
            return Err(Error::InvalidArgument(format!(
                "key {} does not match the key kinds {:?} of {}",
                key, root.key_kinds, root.name
            )));
        }

        let declared = declared.unwrap_or(key.root());
        let info = self.schema.type_info(declared)?;
        let compatible = if info.is_interface {
            self.schema.types().iter().any(|t| {
                self.schema.hierarchy_root(t.id) == key.root()
                    && self.schema.is_assignable(t.id, declared)
            })
        } else {
            self.schema.hierarchy_root(declared) == key.root()
        };
        if !compatible {
            return Err(Error::InvalidArgument(format!(
                "{} is not compatible with key {}",
                info.name, key
            )));
        }
        if let Some(CachedEntry::Present(state)) = self.cache.lookup(key) {
            if state.certainty.is_exact() && !self.schema.is_assignable(state.type_id, declared) {
                return Err(Error::InvalidArgument(format!(
                    "{} is not compatible with the cached type {} of {}",
                    info.name, state.type_id, key
                )));
            }
        }

        let Some((type_id, exact)) = planned_type(&self.schema, &self.cache, key, declared)? else {
            tracing::trace!(key = %key, "prefetch of absent object skipped");
            return Ok(None);
        };
        for descriptor in relations {
            let relation = self.schema.relation(descriptor.relation)?;
            let applies = self.schema.is_assignable(type_id, relation.owner)
                || (!exact && self.schema.may_be_assignable(type_id, relation.owner));
            if !applies {
                return Err(Error::InvalidArgument(format!(
                    "relation {} is not declared on {}",
                    relation.name,
                    self.schema.type_info(type_id)?.name
                )));
            }
        }

        Ok(Some(NodeRequest::new(
            key.clone(),
            declared,
            relations.to_vec(),
        )))
    }

    async fn flush(&mut self, mode: ExecutionMode) -> Result<usize, Error> {
        let mut pass = std::mem::take(&mut self.pass);
        if pass.is_empty() {
            pass.complete();
            return Ok(0);
        }

        let started = Instant::now();
        tracing::debug!(nodes = pass.len(), ?mode, "flushing prefetch pass");

        let before = self.batches;
        let mut executor = BatchExecutor {
            schema: &self.schema,
            cache: &mut self.cache,
            plans: &mut self.plans,
            compiler: self.compiler.as_ref(),
            pipeline: self.pipeline.as_ref(),
            materializer: self.materializer.as_ref(),
            max_keys: self.config.max_keys_per_request,
        };
        let result = executor.run(&mut pass, mode, &mut self.batches).await;
        let batches = self.batches - before;

        histogram!("prefetch.flush.duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        counter!("prefetch.flush.total",
            "status" => if result.is_ok() { "success" } else { "failed" }
        )
        .increment(1);

        match result {
            Ok(()) => {
                pass.complete();
                tracing::debug!(batches, "prefetch pass flushed");
                Ok(batches)
            }
            Err(err) => {
                tracing::debug!(error = %err, batches, "prefetch pass discarded");
                Err(err)
            }
        }
    }
}
