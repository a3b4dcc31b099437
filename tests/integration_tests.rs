// tests/integration_tests.rs
use async_trait::async_trait;
use ousia_prefetch::{
    CommandPipeline, Error, ExecutionMode, Key, KeyKind, MemoryAdapter, ObjectCache, PassStatus,
    PlanCompiler, PrefetchConfig, Prefetcher, RelationDescriptor, RelationId, Schema,
    SessionCache, TypeCertainty, TypeId,
    adapters::{FetchPlan, PipelineResult, PlanRequest, Statement},
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

struct Model {
    schema: Arc<Schema>,
    company: TypeId,
    person: TypeId,
    animal: TypeId,
    dog: TypeId,
    named: TypeId,
    title: RelationId,
    name: RelationId,
    employer: RelationId,
    favourite: RelationId,
    friends: RelationId,
    bark: RelationId,
}

fn model() -> Model {
    let mut b = Schema::builder();
    let named = b.interface("Named");

    let company = b.root("Company", 1);
    let title = b.column(company, "title");
    b.lazy_column(company, "history");

    let animal = b.root("Animal", 1);
    b.set_abstract(animal);
    b.column(animal, "nickname");
    let dog = b.subtype("Dog", animal);
    let bark = b.column(dog, "bark");
    let cat = b.subtype("Cat", animal);
    b.column(cat, "lives");

    let person = b.root("Person", 1);
    b.implement(person, named);
    let name = b.column(person, "name");
    let employer = b.reference(person, "employer", company);
    let favourite = b.reference(person, "favourite", animal);
    let friends = b.collection(person, "friends", person);

    Model {
        schema: Arc::new(b.build().unwrap()),
        company,
        person,
        animal,
        dog,
        named,
        title,
        name,
        employer,
        favourite,
        friends,
        bark,
    }
}

fn setup() -> (Model, Arc<MemoryAdapter>, Prefetcher<SessionCache>) {
    let m = model();
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&m.schema)));
    let cache = SessionCache::new(Arc::clone(&m.schema));
    let prefetcher = Prefetcher::new(Arc::clone(&m.schema), cache, Arc::clone(&adapter));
    (m, adapter, prefetcher)
}

fn value_of<'a>(
    prefetcher: &'a Prefetcher<SessionCache>,
    key: &Key,
    column: usize,
) -> Option<&'a Value> {
    prefetcher
        .cache()
        .lookup(key)
        .and_then(|e| e.as_present())
        .and_then(|s| s.value(column))
}

#[tokio::test]
async fn test_prefetch_loads_columns_in_one_batch() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    adapter
        .insert(m.person, ann.clone(), &[("name", json!("ann"))])
        .unwrap();

    let handle = prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.name)])
        .await
        .unwrap();
    assert_eq!(prefetcher.pending_nodes(), 1);
    assert_eq!(handle.status(), PassStatus::Pending);

    let batches = prefetcher.execute_tasks_async().await.unwrap();

    assert_eq!(batches, 1);
    assert_eq!(prefetcher.batches_executed(), 1);
    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(handle.status(), PassStatus::Completed);
    let state = prefetcher.entity(&handle).unwrap();
    assert_eq!(state.value(0), Some(&json!("ann")));
    assert_eq!(state.certainty, TypeCertainty::Exact);
}

#[tokio::test]
async fn test_deferred_reference_resolves_after_owner_row() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    let acme = Key::single(m.company, 10);
    adapter
        .insert(m.person, ann.clone(), &[("employer.0", json!(10))])
        .unwrap();
    adapter
        .insert(
            m.company,
            acme.clone(),
            &[("title", json!("acme")), ("history", json!("long"))],
        )
        .unwrap();

    prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.employer)])
        .await
        .unwrap();
    let node = prefetcher.pending_pass().nodes().next().unwrap();
    assert!(node.has_placeholder(m.employer));

    let batches = prefetcher.execute_tasks_async().await.unwrap();

    assert_eq!(batches, 2);
    assert_eq!(value_of(&prefetcher, &acme, 0), Some(&json!("acme")));
    // lazy columns stay unloaded unless asked for
    assert_eq!(value_of(&prefetcher, &acme, 1), None);
    assert_eq!(prefetcher.pending_nodes(), 0);
}

#[tokio::test]
async fn test_loaded_foreign_key_skips_the_deferred_phase() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    adapter
        .insert(m.person, ann.clone(), &[("employer.0", json!(10))])
        .unwrap();
    adapter
        .insert(m.company, Key::single(m.company, 10), &[("title", json!("acme"))])
        .unwrap();

    let key_only = RelationDescriptor::new(m.employer).with_fields(false);
    prefetcher
        .prefetch_async(&ann, None, &[key_only])
        .await
        .unwrap();
    prefetcher.execute_tasks_async().await.unwrap();

    let employer = RelationDescriptor::new(m.employer).with_lazy_fields(true);
    prefetcher.prefetch_async(&ann, None, &[employer]).await.unwrap();
    // the owner is already loaded, so only the target is pending
    assert_eq!(prefetcher.pending_nodes(), 1);
    let batches = prefetcher.execute_tasks_async().await.unwrap();

    assert_eq!(batches, 1);
    let acme = Key::single(m.company, 10);
    assert_eq!(value_of(&prefetcher, &acme, 0), Some(&json!("acme")));
    assert_eq!(value_of(&prefetcher, &acme, 1), Some(&Value::Null));
}

#[tokio::test]
async fn test_large_group_is_split_into_bounded_sub_requests() {
    let m = model();
    let adapter = Arc::new(
        MemoryAdapter::new(Arc::clone(&m.schema)).with_statements_per_round_trip(1),
    );
    let cache = SessionCache::new(Arc::clone(&m.schema));
    let mut prefetcher = Prefetcher::new(Arc::clone(&m.schema), cache, Arc::clone(&adapter));

    for i in 0..90 {
        let key = Key::single(m.company, i);
        adapter
            .insert(m.company, key.clone(), &[("title", json!(format!("c{}", i)))])
            .unwrap();
        prefetcher
            .prefetch_async(&key, None, &[RelationDescriptor::new(m.title)])
            .await
            .unwrap();
    }
    assert_eq!(prefetcher.pending_fetch_groups(), 1);

    let batches = prefetcher.execute_tasks_async().await.unwrap();

    assert_eq!(adapter.statement_sizes(), vec![40, 40, 10]);
    assert_eq!(batches, 3);
    assert_eq!(prefetcher.compiled_plans(), 1);
}

#[tokio::test]
async fn test_node_ceiling_forces_eager_flush() {
    let (m, adapter, mut prefetcher) = setup();
    let mut last = None;

    for i in 0..120 {
        let key = Key::single(m.company, i);
        adapter
            .insert(m.company, key.clone(), &[("title", json!("t"))])
            .unwrap();
        if i == 119 {
            assert_eq!(prefetcher.pending_nodes(), 119);
            assert_eq!(adapter.executions(), 0);
        }
        last = Some(
            prefetcher
                .prefetch_async(&key, None, &[RelationDescriptor::new(m.title)])
                .await
                .unwrap(),
        );
    }

    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(adapter.executions(), 1);
    assert_eq!(adapter.statement_sizes(), vec![40, 40, 40]);
    assert_eq!(last.unwrap().status(), PassStatus::Completed);
}

#[tokio::test]
async fn test_configured_ceiling_and_chunk_size() {
    let m = model();
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&m.schema)));
    let cache = SessionCache::new(Arc::clone(&m.schema));
    let config = PrefetchConfig {
        max_pending_nodes: 4,
        max_keys_per_request: 3,
        ..PrefetchConfig::default()
    };
    let mut prefetcher =
        Prefetcher::with_config(Arc::clone(&m.schema), cache, Arc::clone(&adapter), config)
            .unwrap();

    for i in 0..4 {
        let key = Key::single(m.company, i);
        prefetcher
            .prefetch_async(&key, None, &[RelationDescriptor::new(m.title)])
            .await
            .unwrap();
    }

    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(adapter.statement_sizes(), vec![3, 1]);
}

#[test]
fn test_zero_config_values_are_rejected() {
    let m = model();
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&m.schema)));
    let config = PrefetchConfig {
        max_keys_per_request: 0,
        ..PrefetchConfig::default()
    };
    let result = Prefetcher::with_config(
        Arc::clone(&m.schema),
        SessionCache::new(Arc::clone(&m.schema)),
        adapter,
        config,
    );
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_absent_object_is_cached_and_short_circuits() {
    let (m, adapter, mut prefetcher) = setup();
    let missing = Key::single(m.company, 404);

    prefetcher
        .prefetch(&missing, None, &[RelationDescriptor::new(m.title)])
        .unwrap();
    prefetcher.execute_tasks().unwrap();

    assert!(prefetcher.cache().lookup(&missing).unwrap().is_removed());
    assert_eq!(adapter.executions(), 1);

    let handle = prefetcher
        .prefetch(&missing, None, &[RelationDescriptor::new(m.title)])
        .unwrap();
    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(handle.status(), PassStatus::Completed);
    assert!(prefetcher.entity(&handle).is_none());
    assert_eq!(prefetcher.execute_tasks().unwrap(), 0);
    assert_eq!(adapter.executions(), 1);
}

#[test]
fn test_cached_data_spawns_no_new_work() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    let bob = Key::single(m.person, 2);
    adapter
        .insert(m.person, ann.clone(), &[("name", json!("ann"))])
        .unwrap();
    adapter
        .insert(m.person, bob.clone(), &[("name", json!("bob"))])
        .unwrap();
    adapter.link(&ann, m.friends, &bob);

    let relations = [
        RelationDescriptor::new(m.name),
        RelationDescriptor::new(m.friends),
    ];
    prefetcher.prefetch(&ann, None, &relations).unwrap();
    prefetcher.execute_tasks().unwrap();

    prefetcher.prefetch(&ann, None, &relations).unwrap();
    assert_eq!(prefetcher.pending_fetch_groups(), 0);
    assert_eq!(prefetcher.pending_collection_tasks(), 0);
    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(value_of(&prefetcher, &bob, 0), Some(&json!("bob")));
}

#[test]
fn test_repeated_prefetch_is_idempotent() {
    let (m, _, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    let relations = [
        RelationDescriptor::new(m.name),
        RelationDescriptor::new(m.employer),
        RelationDescriptor::new(m.friends).limit(5),
    ];

    prefetcher.prefetch(&ann, None, &relations).unwrap();
    let once = (
        prefetcher.pending_nodes(),
        prefetcher.pending_fetch_groups(),
        prefetcher.pending_collection_tasks(),
    );
    prefetcher.prefetch(&ann, None, &relations).unwrap();
    let twice = (
        prefetcher.pending_nodes(),
        prefetcher.pending_fetch_groups(),
        prefetcher.pending_collection_tasks(),
    );

    assert_eq!(once, (1, 1, 1));
    assert_eq!(once, twice);
}

#[test]
fn test_failed_flush_discards_the_pass() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    adapter
        .insert(m.person, ann.clone(), &[("name", json!("ann"))])
        .unwrap();

    let handle = prefetcher
        .prefetch(&ann, None, &[RelationDescriptor::new(m.name)])
        .unwrap();
    adapter.fail_next_execution();

    assert!(matches!(prefetcher.execute_tasks(), Err(Error::Storage(_))));
    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(handle.status(), PassStatus::Discarded);
    assert!(prefetcher.cache().lookup(&ann).is_none());

    // nothing is replayed; the caller re-issues what it still needs
    assert_eq!(prefetcher.execute_tasks().unwrap(), 0);
    prefetcher
        .prefetch(&ann, None, &[RelationDescriptor::new(m.name)])
        .unwrap();
    prefetcher.execute_tasks().unwrap();
    assert_eq!(value_of(&prefetcher, &ann, 0), Some(&json!("ann")));
}

#[tokio::test]
async fn test_unknown_concrete_type_is_probed_first() {
    let (m, adapter, mut prefetcher) = setup();
    let rex = Key::single(m.animal, 7);
    adapter
        .insert(
            m.dog,
            rex.clone(),
            &[("nickname", json!("rex")), ("bark", json!("woof"))],
        )
        .unwrap();

    prefetcher
        .prefetch_async(&rex, None, &[RelationDescriptor::new(m.bark)])
        .await
        .unwrap();
    let batches = prefetcher.execute_tasks_async().await.unwrap();

    assert_eq!(batches, 2);
    let state = prefetcher.cache().lookup(&rex).unwrap().as_present().unwrap();
    assert_eq!(state.type_id, m.dog);
    assert_eq!(state.certainty, TypeCertainty::Exact);
    assert_eq!(state.value(0), Some(&json!("rex")));
    assert_eq!(state.value(1), Some(&json!("woof")));

    // the exact type is now known, so the next request addresses it directly
    prefetcher
        .prefetch_async(&rex, Some(m.animal), &[RelationDescriptor::new(m.bark)])
        .await
        .unwrap();
    assert_eq!(prefetcher.pending_nodes(), 0);
}

#[tokio::test]
async fn test_reference_to_abstract_type_loads_concrete_defaults() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    let rex = Key::single(m.animal, 7);
    adapter
        .insert(m.person, ann.clone(), &[("favourite.0", json!(7))])
        .unwrap();
    adapter
        .insert(
            m.dog,
            rex.clone(),
            &[("nickname", json!("rex")), ("bark", json!("woof"))],
        )
        .unwrap();

    prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.favourite)])
        .await
        .unwrap();
    let batches = prefetcher.execute_tasks_async().await.unwrap();

    // owner row, type probe, then the concrete type's own columns
    assert_eq!(batches, 3);
    let state = prefetcher.cache().lookup(&rex).unwrap().as_present().unwrap();
    assert_eq!(state.type_id, m.dog);
    assert_eq!(state.value(1), Some(&json!("woof")));
}

#[test]
fn test_invalid_arguments_fail_before_fetching() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);

    let wrong_type = prefetcher.prefetch(&ann, Some(m.company), &[]);
    assert!(matches!(wrong_type, Err(Error::InvalidArgument(_))));

    let wrong_relation = prefetcher.prefetch(&ann, None, &[RelationDescriptor::new(m.title)]);
    assert!(matches!(wrong_relation, Err(Error::InvalidArgument(_))));

    let subtype_relation = prefetcher.prefetch(
        &Key::single(m.animal, 1),
        Some(m.animal),
        &[RelationDescriptor::new(m.employer)],
    );
    assert!(matches!(subtype_relation, Err(Error::InvalidArgument(_))));

    let not_implemented = prefetcher.prefetch(&Key::single(m.company, 1), Some(m.named), &[]);
    assert!(matches!(not_implemented, Err(Error::InvalidArgument(_))));

    let bad_key = prefetcher.prefetch(&Key::new(m.person, vec![]), None, &[]);
    assert!(matches!(bad_key, Err(Error::InvalidArgument(_))));

    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(adapter.executions(), 0);

    // an implemented interface is an acceptable declared type
    prefetcher
        .prefetch(&ann, Some(m.named), &[RelationDescriptor::new(m.name)])
        .unwrap();
    assert_eq!(prefetcher.pending_nodes(), 1);
}

#[tokio::test]
async fn test_collection_limits_and_enumeration() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    adapter.insert(m.person, ann.clone(), &[]).unwrap();
    for id in 2..5 {
        let friend = Key::single(m.person, id);
        adapter
            .insert(m.person, friend.clone(), &[("name", json!(format!("p{}", id)))])
            .unwrap();
        adapter.link(&ann, m.friends, &friend);
    }

    let limited = RelationDescriptor::new(m.friends).limit(2);
    prefetcher.prefetch_async(&ann, None, &[limited]).await.unwrap();
    prefetcher.execute_tasks_async().await.unwrap();
    {
        let state = prefetcher.cache().collection(&ann, m.friends).unwrap();
        assert_eq!(state.confirmed_count(), 2);
        assert_eq!(state.total_item_count(), None);
        assert!(!state.is_fully_loaded());
    }

    // enough items are cached for the same limit
    prefetcher.prefetch_async(&ann, None, &[limited]).await.unwrap();
    assert_eq!(prefetcher.pending_collection_tasks(), 0);

    prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.friends)])
        .await
        .unwrap();
    prefetcher.execute_tasks_async().await.unwrap();

    let state = prefetcher.cache_mut().collection_mut(&ann, m.friends);
    assert!(state.is_fully_loaded());
    assert_eq!(state.total_item_count(), Some(3));
    let friends: Vec<Key> = (2..5).map(|id| Key::single(m.person, id)).collect();
    assert_eq!(state.keys(), friends);

    let mut cursor = state.cursor();
    assert_eq!(cursor.advance(state).unwrap().unwrap(), friends[0]);
    assert!(state.add(Key::single(m.person, 9)));
    assert!(matches!(
        cursor.advance(state),
        Some(Err(Error::ConcurrentModification))
    ));
    assert!(state.is_fully_loaded());

    state.rollback_state();
    assert_eq!(state.keys(), friends);
    assert_eq!(state.total_item_count(), Some(3));
}

#[test]
fn test_cleared_cache_invalidates_handles() {
    let (m, adapter, mut prefetcher) = setup();
    let ann = Key::single(m.person, 1);
    adapter
        .insert(m.person, ann.clone(), &[("name", json!("ann"))])
        .unwrap();

    let handle = prefetcher
        .prefetch(&ann, None, &[RelationDescriptor::new(m.name)])
        .unwrap();
    prefetcher.execute_tasks().unwrap();
    assert!(prefetcher.entity(&handle).is_some());

    prefetcher.cache_mut().clear();
    assert!(prefetcher.entity(&handle).is_none());
}

/// Serves the first `live_calls` executions, then never answers.
struct StalledAdapter {
    inner: MemoryAdapter,
    live_calls: AtomicUsize,
}

impl StalledAdapter {
    fn new(inner: MemoryAdapter, live_calls: usize) -> Self {
        Self {
            inner,
            live_calls: AtomicUsize::new(live_calls),
        }
    }
}

impl PlanCompiler for StalledAdapter {
    fn compile(&self, request: &PlanRequest) -> Result<FetchPlan, Error> {
        self.inner.compile(request)
    }
}

#[async_trait]
impl CommandPipeline for StalledAdapter {
    async fn execute(
        &self,
        statements: &[Statement],
        mode: ExecutionMode,
    ) -> Result<PipelineResult, Error> {
        let live = self
            .live_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if live {
            return self.inner.execute(statements, mode).await;
        }
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_cancelled_flush_discards_the_pass() {
    let m = model();
    let adapter = Arc::new(StalledAdapter::new(
        MemoryAdapter::new(Arc::clone(&m.schema)),
        0,
    ));
    let cache = SessionCache::new(Arc::clone(&m.schema));
    let mut prefetcher = Prefetcher::new(Arc::clone(&m.schema), cache, adapter);
    let ann = Key::single(m.person, 1);

    let handle = prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.name)])
        .await
        .unwrap();
    let flush = tokio::time::timeout(Duration::from_millis(20), prefetcher.execute_tasks_async());
    assert!(flush.await.is_err());

    assert_eq!(prefetcher.pending_nodes(), 0);
    assert_eq!(handle.status(), PassStatus::Discarded);
    assert_eq!(prefetcher.batches_executed(), 0);
}

#[tokio::test]
async fn test_cancelled_flush_keeps_count_of_finished_phases() {
    let m = model();
    let store = MemoryAdapter::new(Arc::clone(&m.schema));
    let ann = Key::single(m.person, 1);
    store
        .insert(m.person, ann.clone(), &[("employer.0", json!(10))])
        .unwrap();
    store
        .insert(m.company, Key::single(m.company, 10), &[("title", json!("acme"))])
        .unwrap();
    let adapter = Arc::new(StalledAdapter::new(store, 1));
    let cache = SessionCache::new(Arc::clone(&m.schema));
    let mut prefetcher = Prefetcher::new(Arc::clone(&m.schema), cache, adapter);

    prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.employer)])
        .await
        .unwrap();
    let flush = tokio::time::timeout(Duration::from_millis(20), prefetcher.execute_tasks_async());
    assert!(flush.await.is_err());

    // the owner row phase finished before the reference phase stalled
    assert_eq!(prefetcher.batches_executed(), 1);
    assert!(value_of(&prefetcher, &ann, 1).is_some());
}

#[test]
fn test_string_and_uuid_keys_survive_fetch() {
    let mut b = Schema::builder();
    let tag = b.keyed_root("Tag", &[KeyKind::String]);
    b.column(tag, "label");
    let device = b.keyed_root("Device", &[KeyKind::Uuid]);
    let serial = b.column(device, "serial");
    let tagged = b.reference(device, "tag", tag);
    let schema = Arc::new(b.build().unwrap());

    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&schema)));
    let cache = SessionCache::new(Arc::clone(&schema));
    let mut prefetcher = Prefetcher::new(Arc::clone(&schema), cache, Arc::clone(&adapter));

    // a string key that reads like a uuid
    let text = "550e8400-e29b-41d4-a716-446655440000";
    let tag_key = Key::single(tag, text);
    let device_key = Key::single(device, Uuid::now_v7());
    adapter
        .insert(tag, tag_key.clone(), &[("label", json!("lab"))])
        .unwrap();
    adapter
        .insert(
            device,
            device_key.clone(),
            &[("serial", json!("s-1")), ("tag.0", json!(text))],
        )
        .unwrap();

    let handle = prefetcher
        .prefetch(
            &device_key,
            None,
            &[RelationDescriptor::new(serial), RelationDescriptor::new(tagged)],
        )
        .unwrap();
    let batches = prefetcher.execute_tasks().unwrap();

    assert_eq!(batches, 2);
    assert_eq!(prefetcher.entity(&handle).unwrap().value(0), Some(&json!("s-1")));
    assert_eq!(value_of(&prefetcher, &tag_key, 0), Some(&json!("lab")));
    assert!(!prefetcher.cache().lookup(&tag_key).unwrap().is_removed());

    let wrong_kind = prefetcher.prefetch(&Key::single(tag, 5), None, &[]);
    assert!(matches!(wrong_kind, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_relation_declared_on_interface_waits_for_concrete_type() {
    let mut b = Schema::builder();
    let pet = b.interface("Pet");
    let toy = b.root("Toy", 1);
    b.column(toy, "name");
    let animal = b.root("Animal", 1);
    b.set_abstract(animal);
    b.column(animal, "nickname");
    let dog = b.subtype("Dog", animal);
    b.implement(dog, pet);
    let cat = b.subtype("Cat", animal);
    let toys = b.collection(pet, "toys", toy);
    let schema = Arc::new(b.build().unwrap());

    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&schema)));
    let cache = SessionCache::new(Arc::clone(&schema));
    let mut prefetcher = Prefetcher::new(Arc::clone(&schema), cache, Arc::clone(&adapter));

    let rex = Key::single(animal, 1);
    let tom = Key::single(animal, 2);
    adapter.insert(dog, rex.clone(), &[("nickname", json!("rex"))]).unwrap();
    adapter.insert(cat, tom.clone(), &[("nickname", json!("tom"))]).unwrap();
    for id in [100, 101] {
        let key = Key::single(toy, id);
        adapter.insert(toy, key.clone(), &[("name", json!("ball"))]).unwrap();
        adapter.link(&rex, toys, &key);
    }

    prefetcher
        .prefetch(&rex, Some(pet), &[RelationDescriptor::new(toys)])
        .unwrap();
    // the concrete type is learned first, the collection follows
    assert_eq!(prefetcher.execute_tasks().unwrap(), 2);
    let state = prefetcher.cache().collection(&rex, toys).unwrap();
    assert_eq!(state.confirmed_count(), 2);
    assert!(state.is_fully_loaded());

    // a cat is not a pet, so the relation is dropped once that is known
    prefetcher
        .prefetch(&tom, None, &[RelationDescriptor::new(toys)])
        .unwrap();
    assert_eq!(prefetcher.execute_tasks().unwrap(), 1);
    assert!(prefetcher.cache().collection(&tom, toys).is_none());
}

#[tokio::test]
async fn test_session_cache_uses_configured_collection_capacity() {
    let m = model();
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&m.schema)));
    let config = PrefetchConfig {
        collection_cache_capacity: 2,
        ..PrefetchConfig::default()
    };
    let mut prefetcher =
        Prefetcher::session(Arc::clone(&m.schema), Arc::clone(&adapter), config).unwrap();
    let ann = Key::single(m.person, 1);
    adapter.insert(m.person, ann.clone(), &[]).unwrap();
    for id in 2..5 {
        let friend = Key::single(m.person, id);
        adapter.insert(m.person, friend.clone(), &[]).unwrap();
        adapter.link(&ann, m.friends, &friend);
    }

    prefetcher
        .prefetch_async(&ann, None, &[RelationDescriptor::new(m.friends)])
        .await
        .unwrap();
    prefetcher.execute_tasks_async().await.unwrap();

    let state = prefetcher.cache().collection(&ann, m.friends).unwrap();
    assert_eq!(state.confirmed_count(), 2);
    assert_eq!(state.total_item_count(), Some(3));
}
