use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;

/// Thread-safe registry of shared objects (models, dictionaries, batches,
/// regularizers, score calculators).
///
/// Values are handed out as `Arc`s: replacing an entry publishes the new
/// object atomically while readers keep the snapshot they already hold.
#[derive(Debug)]
pub struct ThreadSafeHolder<K, V>
where
    K: Eq + Hash,
    V: ?Sized,
{
    map: DashMap<K, Arc<V>, RandomState>,
}

impl<K, V> Default for ThreadSafeHolder<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ThreadSafeHolder<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert or replace, returning the previous value.
    pub fn set(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.map.insert(key, value)
    }

    pub fn erase<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn has_key<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}
