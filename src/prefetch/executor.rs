use std::collections::HashMap;
use std::ops::Range;

use metrics::counter;

use crate::{
    adapters::{CommandPipeline, ExecutionMode, PlanCompiler, RowMaterializer},
    cache::ObjectCache,
    error::Error,
    prefetch::{
        collection_task::CollectionTask,
        group::{FetchGroup, GroupKey},
        pass::PendingPass,
        plans::PlanCache,
    },
    schema::Schema,
};

/// Runs a pending pass to completion against the external pipeline.
pub(crate) struct BatchExecutor<'a, C: ObjectCache + ?Sized> {
    pub schema: &'a Schema,
    pub cache: &'a mut C,
    pub plans: &'a mut PlanCache,
    pub compiler: &'a dyn PlanCompiler,
    pub pipeline: &'a dyn CommandPipeline,
    pub materializer: &'a dyn RowMaterializer,
    pub max_keys: usize,
}

impl<C: ObjectCache + ?Sized> BatchExecutor<'_, C> {
    /// Execute phases until no node is pending. Round trips are added to
    /// `batches` as they complete, so a failed run still reports the ones
    /// already spent.
    pub async fn run(
        &mut self,
        pass: &mut PendingPass,
        mode: ExecutionMode,
        batches: &mut usize,
    ) -> Result<(), Error> {
        let mut phase = 0;
        loop {
            let pending = pass.pending_indexes();
            if pending.is_empty() {
                return Ok(());
            }
            phase += 1;
            tracing::trace!(phase, nodes = pending.len(), "prefetch phase");
            *batches += self.run_phase(pass, &pending, mode).await?;
        }
    }

    async fn run_phase(
        &mut self,
        pass: &mut PendingPass,
        pending: &[usize],
        mode: ExecutionMode,
    ) -> Result<usize, Error> {
        let mut groups: Vec<FetchGroup> = Vec::new();
        let mut group_index: HashMap<GroupKey, usize> = HashMap::new();
        let mut tasks: Vec<CollectionTask> = Vec::new();

        for &index in pending {
            let node = pass.node_mut(index);
            if let Some(columns) = node.take_fetch() {
                let key = GroupKey::new(node.type_id(), columns);
                let slot = *group_index.entry(key.clone()).or_insert_with(|| {
                    groups.push(FetchGroup::new(key));
                    groups.len() - 1
                });
                groups[slot].add(node.key().clone(), node.is_exact());
            }
            tasks.extend(node.take_collections());
        }

        let mut statements = Vec::new();
        let mut spans: Vec<Range<usize>> = Vec::with_capacity(groups.len());
        for group in &mut groups {
            let start = statements.len();
            group.register_sub_requests(
                self.plans,
                self.compiler,
                self.max_keys,
                &mut statements,
            )?;
            spans.push(start..statements.len());
        }
        let tasks_start = statements.len();
        for task in &tasks {
            let plan = self.plans.get_or_compile(task.plan_request(), self.compiler)?;
            statements.push(task.statement(plan));
        }

        let mut round_trips = 0;
        if !statements.is_empty() {
            let result = self.pipeline.execute(&statements, mode).await?;
            if result.rows.len() != statements.len() {
                return Err(Error::Storage(format!(
                    "pipeline answered {} of {} statements",
                    result.rows.len(),
                    statements.len()
                )));
            }
            round_trips = result.round_trips;
            counter!("prefetch.round_trips.total").increment(round_trips as u64);

            for (group, span) in groups.iter().zip(spans) {
                group.reconcile(
                    &result.rows[span],
                    self.materializer,
                    self.schema,
                    &mut *self.cache,
                )?;
            }
            for (offset, task) in tasks.iter().enumerate() {
                let index = tasks_start + offset;
                task.reconcile(
                    &statements[index].plan.shape,
                    &result.rows[index],
                    self.materializer,
                    &mut *self.cache,
                )?;
            }
        }

        for &index in pending {
            pass.node_mut(index).complete_first_pass()?;
        }
        let mut spawned = Vec::new();
        for &index in pending {
            spawned.extend(pass.node_mut(index).resolve(self.schema, &*self.cache)?);
        }
        for request in spawned {
            pass.request(request, self.schema, &*self.cache)?;
        }

        Ok(round_trips)
    }
}
