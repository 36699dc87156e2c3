//! Bounded least-recently-used cache for search results and paper details.

use lru::LruCache;
use serde::Serialize;
use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Hit/miss counters of a [`BoundedCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// An LRU map that never holds more than `capacity` entries.
///
/// A successful `get` makes the entry the most recent one; inserting into a
/// full cache evicts the least recent entry.
#[derive(Debug)]
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    hits: u64,
    misses: u64,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace `key`. Returns the entry evicted to make room.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.contains(&key) {
            self.entries.put(key, value);
            None
        } else {
            self.entries.push(key, value)
        }
    }

    /// Membership test that does not touch the recency order.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains(key)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.pop(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.len(),
            capacity: self.capacity(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    pub fn get_cloned<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).cloned()
    }
}
