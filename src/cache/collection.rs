use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::{error::Error, key::Key};

#[derive(Debug, Clone)]
struct Snapshot {
    confirmed: Vec<Key>,
    added: BTreeSet<Key>,
    removed: BTreeSet<Key>,
    total: Option<usize>,
}

/// Cached membership of one related collection.
///
/// `confirmed` holds the members the server reported, bounded and ordered by
/// recency. `added` and `removed` are local deltas not yet reflected by the
/// server. `total` is the item count as seen locally, already adjusted for
/// the deltas.
pub struct CollectionState {
    confirmed: LruCache<Key, ()>,
    added: BTreeSet<Key>,
    removed: BTreeSet<Key>,
    total: Option<usize>,
    version: u64,
    snapshot: Option<Snapshot>,
}

impl CollectionState {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            confirmed: LruCache::new(capacity),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            total: None,
            version: 0,
            snapshot: None,
        }
    }

    pub fn is_fully_loaded(&self) -> bool {
        match self.total {
            Some(total) => {
                (self.confirmed.len() + self.added.len()).checked_sub(self.removed.len())
                    == Some(total)
            }
            None => false,
        }
    }

    pub fn total_item_count(&self) -> Option<usize> {
        self.total
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        !self.removed.contains(key) && (self.added.contains(key) || self.confirmed.contains(key))
    }

    /// Definitive membership answer without a fetch, or `None` when only the
    /// server can tell.
    pub fn cached_contains(&self, key: &Key) -> Option<bool> {
        if self.contains(key) {
            Some(true)
        } else if self.removed.contains(key) || self.is_fully_loaded() {
            Some(false)
        } else {
            None
        }
    }

    /// Current members: confirmed ones in fetch order, then local additions.
    pub fn keys(&self) -> Vec<Key> {
        self.confirmed
            .iter()
            .rev()
            .map(|(k, _)| k)
            .filter(|k| !self.removed.contains(*k))
            .chain(self.added.iter())
            .cloned()
            .collect()
    }

    /// Enumeration that fails once the collection is modified locally.
    pub fn cursor(&self) -> CollectionCursor {
        CollectionCursor {
            keys: self.keys(),
            position: 0,
            version: self.version,
        }
    }

    /// Reconcile with a server answer. `total` is the server-side item count
    /// when the answer is known to be complete or the count is known.
    ///
    /// Without local deltas the confirmed set is replaced wholesale. With
    /// deltas:
    /// - a returned key leaves `removed` and `added` (the server has it);
    /// - a removed key missing from the answer stays removed, unless the
    ///   answer covers the whole collection (`total == returned count`), in
    ///   which case the removal is already reflected and the delta is dropped.
    pub fn update(&mut self, keys: impl IntoIterator<Item = Key>, total: Option<usize>) {
        let keys: Vec<Key> = keys.into_iter().collect();

        if !self.has_changes() {
            self.replace_confirmed(keys);
            self.total = total;
            return;
        }

        let authoritative = total == Some(keys.len());
        let returned: HashSet<&Key> = keys.iter().collect();

        self.removed.retain(|k| !returned.contains(k) && !authoritative);
        self.added.retain(|k| !returned.contains(k));

        let (added, removed) = (self.added.len(), self.removed.len());
        self.total = total.map(|t| (t + added).saturating_sub(removed));
        self.replace_confirmed(keys);
    }

    pub fn add(&mut self, key: Key) -> bool {
        if self.cached_contains(&key) == Some(true) {
            return false;
        }
        self.remember_if_needed();
        if !self.removed.remove(&key) {
            self.added.insert(key);
        }
        self.total = self.total.map(|t| t + 1);
        self.version += 1;
        true
    }

    pub fn remove(&mut self, key: &Key) -> bool {
        if self.cached_contains(key) == Some(false) {
            return false;
        }
        self.remember_if_needed();
        if !self.added.remove(key) {
            self.removed.insert(key.clone());
        }
        self.total = self.total.map(|t| t.saturating_sub(1));
        self.version += 1;
        true
    }

    /// Snapshot current membership for a later `rollback_state`.
    pub fn remember_state(&mut self) {
        self.snapshot = Some(self.capture());
    }

    /// Forget the retained snapshot.
    pub fn commit_state(&mut self) {
        self.snapshot = None;
    }

    /// Fold local deltas into the confirmed set. The snapshot is kept so the
    /// surrounding transaction can still roll back.
    pub fn apply_changes(&mut self) {
        if !self.has_changes() {
            return;
        }
        for key in std::mem::take(&mut self.removed) {
            self.confirmed.pop(&key);
        }
        for key in std::mem::take(&mut self.added) {
            self.confirmed.put(key, ());
        }
    }

    /// Discard local deltas and undo their effect on the item count.
    pub fn cancel_changes(&mut self) {
        if !self.has_changes() {
            return;
        }
        let (added, removed) = (self.added.len(), self.removed.len());
        self.total = self.total.map(|t| (t + removed).saturating_sub(added));
        self.added.clear();
        self.removed.clear();
        self.snapshot = None;
        self.version += 1;
    }

    /// Restore membership exactly as it was when the snapshot was taken.
    pub fn rollback_state(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.replace_confirmed(snapshot.confirmed);
            self.added = snapshot.added;
            self.removed = snapshot.removed;
            self.total = snapshot.total;
            self.version += 1;
        }
    }

    fn remember_if_needed(&mut self) {
        if self.snapshot.is_none() {
            self.remember_state();
        }
    }

    fn capture(&self) -> Snapshot {
        Snapshot {
            confirmed: self.confirmed.iter().rev().map(|(k, _)| k.clone()).collect(),
            added: self.added.clone(),
            removed: self.removed.clone(),
            total: self.total,
        }
    }

    fn replace_confirmed(&mut self, keys: Vec<Key>) {
        self.confirmed.clear();
        for key in keys {
            self.confirmed.put(key, ());
        }
    }
}

impl std::fmt::Debug for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionState")
            .field("confirmed", &self.confirmed.len())
            .field("added", &self.added)
            .field("removed", &self.removed)
            .field("total", &self.total)
            .field("version", &self.version)
            .finish()
    }
}

/// Detached enumeration over a collection state. Each step is checked
/// against the version captured when the cursor was created.
#[derive(Debug, Clone)]
pub struct CollectionCursor {
    keys: Vec<Key>,
    position: usize,
    version: u64,
}

impl CollectionCursor {
    pub fn advance(&mut self, state: &CollectionState) -> Option<Result<Key, Error>> {
        if state.version() != self.version {
            return Some(Err(Error::ConcurrentModification));
        }
        let key = self.keys.get(self.position)?.clone();
        self.position += 1;
        Some(Ok(key))
    }
}
