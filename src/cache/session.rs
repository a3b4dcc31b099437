use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    cache::{CachedEntry, CollectionState, EntityState, LifetimeToken, ObjectCache, RowUpdate},
    config::{COLLECTION_CACHE_CAPACITY, PrefetchConfig},
    key::{Key, TypeCertainty},
    schema::{RelationId, Schema, TypeId},
};

/// In-memory session cache keyed by stable identity.
pub struct SessionCache {
    schema: Arc<Schema>,
    entries: HashMap<Key, CachedEntry>,
    collections: HashMap<(Key, RelationId), CollectionState>,
    collection_capacity: usize,
    token: LifetimeToken,
}

impl SessionCache {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_collection_capacity(schema, COLLECTION_CACHE_CAPACITY)
    }

    /// Session cache whose collection states hold at most
    /// `config.collection_cache_capacity` confirmed members each.
    pub fn with_config(schema: Arc<Schema>, config: &PrefetchConfig) -> Self {
        Self::with_collection_capacity(schema, config.collection_cache_capacity)
    }

    pub fn with_collection_capacity(schema: Arc<Schema>, collection_capacity: usize) -> Self {
        Self {
            schema,
            entries: HashMap::new(),
            collections: HashMap::new(),
            collection_capacity,
            token: LifetimeToken::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything and start a new lifetime.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.collections.clear();
        self.token = LifetimeToken::new();
    }

    fn width(&self, type_id: TypeId) -> usize {
        self.schema
            .type_info(type_id)
            .map(|info| info.columns.len())
            .unwrap_or(0)
    }
}

/// Decide whether a fetched row may retype an already cached state.
fn narrows(schema: &Schema, state: &EntityState, update: &RowUpdate) -> bool {
    match (state.certainty, update.certainty) {
        (TypeCertainty::Exact, TypeCertainty::Exact) => true,
        (TypeCertainty::Exact, _) => false,
        (_, TypeCertainty::Exact) => true,
        _ => schema.is_subtype(update.type_id, state.type_id),
    }
}

impl ObjectCache for SessionCache {
    fn lookup(&self, key: &Key) -> Option<&CachedEntry> {
        self.entries.get(key)
    }

    fn update(&mut self, key: Key, update: RowUpdate) {
        let fresh_width = self.width(update.type_id);
        let mut state = match self.entries.remove(&key) {
            Some(CachedEntry::Present(mut state)) => {
                if narrows(&self.schema, &state, &update) {
                    state.type_id = update.type_id;
                    state.certainty = update.certainty;
                    state.widen(fresh_width);
                }
                state
            }
            // a found row overrides a cached absence
            _ => EntityState::new(update.type_id, update.certainty, fresh_width),
        };
        for (column, value) in update.values {
            state.set(column, value);
        }
        self.entries.insert(key, CachedEntry::Present(state));
    }

    fn mark_removed(&mut self, key: Key) {
        self.entries.insert(key, CachedEntry::Removed);
    }

    fn collection(&self, owner: &Key, relation: RelationId) -> Option<&CollectionState> {
        self.collections.get(&(owner.clone(), relation))
    }

    fn collection_mut(&mut self, owner: &Key, relation: RelationId) -> &mut CollectionState {
        let capacity = self.collection_capacity;
        self.collections
            .entry((owner.clone(), relation))
            .or_insert_with(|| CollectionState::new(capacity))
    }

    fn lifetime_token(&self) -> LifetimeToken {
        self.token
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn schema() -> (Arc<Schema>, TypeId, TypeId) {
        let mut b = Schema::builder();
        let animal = b.root("Animal", 1);
        b.set_abstract(animal);
        b.column(animal, "name");
        let dog = b.subtype("Dog", animal);
        b.column(dog, "bark");
        (Arc::new(b.build().unwrap()), animal, dog)
    }

    #[test]
    fn test_exact_row_retypes_and_widens_state() {
        let (schema, animal, dog) = schema();
        let mut cache = SessionCache::new(schema);
        let key = Key::single(animal, 1);

        cache.update(
            key.clone(),
            RowUpdate {
                type_id: animal,
                certainty: TypeCertainty::Hierarchy,
                values: vec![(0, Value::from("rex"))],
            },
        );
        cache.update(
            key.clone(),
            RowUpdate {
                type_id: dog,
                certainty: TypeCertainty::Exact,
                values: vec![(1, Value::from("woof"))],
            },
        );
        let state = cache.lookup(&key).and_then(CachedEntry::as_present).unwrap();
        assert_eq!(state.type_id, dog);
        assert_eq!(state.width(), 2);
        assert_eq!(state.value(0), Some(&Value::from("rex")));
        assert!(state.is_loaded(1));
    }

    #[test]
    fn test_less_certain_row_keeps_exact_type() {
        let (schema, animal, dog) = schema();
        let mut cache = SessionCache::new(schema);
        let key = Key::single(animal, 1);

        cache.update(
            key.clone(),
            RowUpdate {
                type_id: dog,
                certainty: TypeCertainty::Exact,
                values: vec![],
            },
        );
        cache.update(
            key.clone(),
            RowUpdate {
                type_id: animal,
                certainty: TypeCertainty::Base,
                values: vec![(0, Value::Null)],
            },
        );
        let state = cache.lookup(&key).and_then(CachedEntry::as_present).unwrap();
        assert_eq!(state.type_id, dog);
        assert_eq!(state.value(0), Some(&Value::Null));
        assert!(!state.is_loaded(1));
    }

    #[test]
    fn test_found_row_overrides_removed_entry() {
        let (schema, animal, dog) = schema();
        let mut cache = SessionCache::new(schema);
        let key = Key::single(animal, 2);

        cache.mark_removed(key.clone());
        assert!(cache.lookup(&key).unwrap().is_removed());

        cache.update(
            key.clone(),
            RowUpdate {
                type_id: dog,
                certainty: TypeCertainty::Exact,
                values: vec![],
            },
        );
        assert!(cache.lookup(&key).unwrap().as_present().is_some());
    }

    #[test]
    fn test_clear_rotates_lifetime_token() {
        let (schema, animal, _) = schema();
        let mut cache = SessionCache::new(schema);
        let before = cache.lifetime_token();
        cache.mark_removed(Key::single(animal, 3));
        cache.clear();
        assert!(cache.is_empty());
        assert_ne!(before, cache.lifetime_token());
    }

    #[test]
    fn test_collection_states_follow_configured_capacity() {
        let (schema, animal, _) = schema();
        let config = PrefetchConfig {
            collection_cache_capacity: 2,
            ..PrefetchConfig::default()
        };
        let mut cache = SessionCache::with_config(schema, &config);
        let owner = Key::single(animal, 1);

        let members = (10..13).map(|id| Key::single(animal, id));
        cache
            .collection_mut(&owner, RelationId(0))
            .update(members, Some(3));
        let state = cache.collection(&owner, RelationId(0)).unwrap();
        assert_eq!(state.confirmed_count(), 2);
        assert!(!state.is_fully_loaded());
    }
}
