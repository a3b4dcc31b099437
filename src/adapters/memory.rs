// adapters/memory.rs
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    adapters::{
        CommandPipeline, ExecutionMode, FetchPlan, PipelineResult, PlanCompiler, PlanRequest,
        PlanSource, RawRow, ResultShape, Statement, StatementParams,
    },
    error::Error,
    key::Key,
    schema::{RelationId, RelationKind, Schema, TypeId},
};

/// Statements sent in one simulated round trip unless configured otherwise.
pub const DEFAULT_STATEMENTS_PER_ROUND_TRIP: usize = 16;

#[derive(Debug, Clone)]
struct StoredRow {
    type_id: TypeId,
    values: Vec<Value>,
}

#[derive(Clone, Default)]
struct MemoryStore {
    rows: Arc<Mutex<HashMap<Key, StoredRow>>>,
    collections: Arc<Mutex<HashMap<(Key, RelationId), Vec<Key>>>>,
    executions: Arc<Mutex<Vec<Vec<usize>>>>,
    fail_next: Arc<AtomicBool>,
}

/// In-memory plan compiler and command pipeline over a row store, used for
/// tests and embedding without a database.
pub struct MemoryAdapter {
    schema: Arc<Schema>,
    store: MemoryStore,
    statements_per_round_trip: usize,
}

impl MemoryAdapter {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            store: MemoryStore::default(),
            statements_per_round_trip: DEFAULT_STATEMENTS_PER_ROUND_TRIP,
        }
    }

    pub fn with_statements_per_round_trip(mut self, statements: usize) -> Self {
        self.statements_per_round_trip = statements.max(1);
        self
    }

    /// Store a row of `type_id`. Columns are addressed by name; the ones not
    /// given are stored as null.
    pub fn insert(
        &self,
        type_id: TypeId,
        key: Key,
        columns: &[(&str, Value)],
    ) -> Result<(), Error> {
        let info = self.schema.type_info(type_id)?;
        let kinds = self.schema.key_kinds(type_id)?;
        let kinds_match = key.values().len() == kinds.len()
            && key.values().iter().zip(kinds).all(|(v, k)| v.kind() == *k);
        if self.schema.hierarchy_root(type_id) != key.root() || !kinds_match {
            return Err(Error::InvalidArgument(format!(
                "key {} does not belong to {}",
                key, info.name
            )));
        }
        let mut values = vec![Value::Null; info.columns.len()];
        for (name, value) in columns {
            let index = info
                .columns
                .iter()
                .position(|c| c.name == *name)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("{} has no column {}", info.name, name))
                })?;
            values[index] = value.clone();
        }
        self.rows().insert(key, StoredRow { type_id, values });
        Ok(())
    }

    pub fn remove(&self, key: &Key) {
        self.rows().remove(key);
    }

    /// Append `member` to the `relation` collection of `owner`.
    pub fn link(&self, owner: &Key, relation: RelationId, member: &Key) {
        self.store
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((owner.clone(), relation))
            .or_default()
            .push(member.clone());
    }

    /// Make the next `execute` call fail with a storage error.
    pub fn fail_next_execution(&self) {
        self.store.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of `execute` calls that reached the store.
    pub fn executions(&self) -> usize {
        self.executions_log().len()
    }

    /// Keys covered by every executed statement, in execution order.
    pub fn statement_sizes(&self) -> Vec<usize> {
        self.executions_log().into_iter().flatten().collect()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, HashMap<Key, StoredRow>> {
        self.store.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn executions_log(&self) -> Vec<Vec<usize>> {
        self.store
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn project(&self, shape: &ResultShape, key: &Key, row: &StoredRow) -> Option<RawRow> {
        if !self.schema.is_assignable(row.type_id, shape.type_id) {
            return None;
        }
        let mut values: Vec<Value> = key.values().iter().map(|v| v.to_value()).collect();
        if shape.has_discriminator {
            values.push(Value::from(row.type_id.0));
        }
        values.extend(
            shape
                .columns
                .iter()
                .map(|c| row.values.get(*c).cloned().unwrap_or(Value::Null)),
        );
        Some(RawRow(values))
    }

    fn run(&self, plan: &FetchPlan, params: &StatementParams) -> Vec<RawRow> {
        let rows = self.rows();
        match (&plan.request.source, params) {
            (_, StatementParams::Keys(keys)) => keys
                .iter()
                .filter_map(|k| rows.get(k).and_then(|r| self.project(&plan.shape, k, r)))
                .collect(),
            (PlanSource::Collection { relation }, StatementParams::Collection { owner, limit }) => {
                let collections = self
                    .store
                    .collections
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let members = collections
                    .get(&(owner.clone(), *relation))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                members
                    .iter()
                    .filter_map(|k| rows.get(k).and_then(|r| self.project(&plan.shape, k, r)))
                    .take(limit.unwrap_or(usize::MAX))
                    .collect()
            }
            (PlanSource::KeyBatch, StatementParams::Collection { .. }) => Vec::new(),
        }
    }
}

impl PlanCompiler for MemoryAdapter {
    fn compile(&self, request: &PlanRequest) -> Result<FetchPlan, Error> {
        let info = self
            .schema
            .type_info(request.target)
            .map_err(|e| Error::Plan(e.to_string()))?;
        if info.is_interface {
            return Err(Error::Plan(format!("cannot fetch interface {}", info.name)));
        }
        if let Some(column) = request.columns.iter().find(|c| *c >= info.columns.len()) {
            return Err(Error::Plan(format!("{} has no column #{}", info.name, column)));
        }
        if let PlanSource::Collection { relation } = request.source {
            let relation = self
                .schema
                .relation(relation)
                .map_err(|e| Error::Plan(e.to_string()))?;
            let collects_target = matches!(
                relation.kind,
                RelationKind::Collection { target } if target == request.target
            );
            if !collects_target {
                return Err(Error::Plan(format!(
                    "{} is not a collection of {}",
                    relation.name, info.name
                )));
            }
        }

        Ok(FetchPlan {
            id: request.fingerprint(),
            request: request.clone(),
            shape: ResultShape {
                type_id: request.target,
                key_width: info.key_width,
                has_discriminator: !info.is_leaf(),
                columns: request.columns.to_vec(),
            },
        })
    }
}

#[async_trait]
impl CommandPipeline for MemoryAdapter {
    async fn execute(
        &self,
        statements: &[Statement],
        mode: ExecutionMode,
    ) -> Result<PipelineResult, Error> {
        if self.store.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage("connection reset".to_string()));
        }

        let rows = statements
            .iter()
            .map(|st| self.run(&st.plan, &st.params))
            .collect();
        let round_trips = statements.len().div_ceil(self.statements_per_round_trip);

        self.store
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statements.iter().map(Statement::key_count).collect());
        tracing::trace!(
            ?mode,
            statements = statements.len(),
            round_trips,
            "memory pipeline executed"
        );

        Ok(PipelineResult { rows, round_trips })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::ColumnSet;

    fn setup() -> (Arc<Schema>, TypeId, TypeId, TypeId) {
        let mut b = Schema::builder();
        let animal = b.root("Animal", 1);
        b.column(animal, "name");
        let dog = b.subtype("Dog", animal);
        b.column(dog, "bark");
        let cat = b.subtype("Cat", animal);
        b.column(cat, "lives");
        (Arc::new(b.build().unwrap()), animal, dog, cat)
    }

    #[tokio::test]
    async fn test_key_batch_skips_rows_of_other_subtypes() {
        let (schema, animal, dog, cat) = setup();
        let adapter = MemoryAdapter::new(schema);
        adapter
            .insert(dog, Key::single(animal, 1), &[("name", json!("rex")), ("bark", json!("loud"))])
            .unwrap();
        adapter
            .insert(cat, Key::single(animal, 2), &[("lives", json!(9))])
            .unwrap();

        let columns: ColumnSet = [0, 1].into_iter().collect();
        let plan = Arc::new(adapter.compile(&PlanRequest::key_batch(dog, columns)).unwrap());
        let statement = Statement {
            plan,
            params: StatementParams::Keys(vec![Key::single(animal, 1), Key::single(animal, 2)]),
        };

        let result = adapter
            .execute(&[statement], ExecutionMode::Suspendable)
            .await
            .unwrap();
        assert_eq!(result.round_trips, 1);
        assert_eq!(result.rows[0], vec![RawRow(vec![json!(1), json!("rex"), json!("loud")])]);
        assert_eq!(adapter.statement_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let (schema, ..) = setup();
        let adapter = MemoryAdapter::new(schema);
        adapter.fail_next_execution();

        assert!(matches!(
            adapter.execute(&[], ExecutionMode::Blocking).await,
            Err(Error::Storage(_))
        ));
        assert!(adapter.execute(&[], ExecutionMode::Blocking).await.is_ok());
        assert_eq!(adapter.executions(), 1);
    }

    #[test]
    fn test_compile_rejects_unknown_column() {
        let (schema, animal, ..) = setup();
        let adapter = MemoryAdapter::new(schema);
        let request = PlanRequest::key_batch(animal, [7].into_iter().collect());
        assert!(matches!(adapter.compile(&request), Err(Error::Plan(_))));
    }
}
