//! LRU cache implementation
//!
//! HashMap keyed by record key with a logical access clock.

use std::collections::HashMap;

struct CacheEntry<V> {
    value: V,
    /// Clock tick of the last access
    last_access: u64,
    /// Insertion sequence, used to break recency ties
    inserted: u64,
}

/// Bounded recency-ordered cache
pub struct LruCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    capacity: usize,
    clock: u64,
    sequence: u64,
}

impl<V: Clone> LruCache<V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            sequence: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert or refresh an entry, evicting the oldest one if full
    ///
    /// Returns the evicted key, if any.
    pub fn put(&mut self, key: impl Into<String>, value: V) -> Option<String> {
        let key = key.into();
        let now = self.tick();

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.last_access = now;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.sequence += 1;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: now,
                inserted: self.sequence,
            },
        );
        evicted
    }

    /// Get a value and refresh its recency
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.value.clone())
    }

    /// Check presence without touching recency
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// First cached value matching the predicate (no recency update)
    pub fn find_one<F>(&self, predicate: F) -> Option<V>
    where
        F: Fn(&V) -> bool,
    {
        self.entries
            .values()
            .find(|entry| predicate(&entry.value))
            .map(|entry| entry.value.clone())
    }

    /// All cached values, most recently touched first
    pub fn all(&self) -> Vec<V> {
        let mut entries: Vec<&CacheEntry<V>> = self.entries.values().collect();
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        entries.into_iter().map(|entry| entry.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_access, entry.inserted))
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&oldest);
        Some(oldest)
    }
}
