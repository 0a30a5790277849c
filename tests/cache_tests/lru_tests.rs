//! Tests for LruCache
//!
//! These tests verify:
//! - Capacity is never exceeded
//! - The least recently touched entry is evicted
//! - Reads refresh recency; presence checks do not

use shardkv::cache::LruCache;

// =============================================================================
// Helper Functions
// =============================================================================

fn filled(capacity: usize) -> LruCache<u32> {
    let mut cache = LruCache::new(capacity);
    for i in 0..capacity as u32 {
        cache.put(format!("k{i}"), i);
    }
    cache
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_overflow_evicts_least_recent() {
    let mut cache = filled(3);

    let evicted = cache.put("k3", 3);

    assert_eq!(evicted.as_deref(), Some("k0"));
    assert_eq!(cache.len(), 3);
    assert!(!cache.has("k0"));
}

#[test]
fn test_get_protects_from_next_eviction() {
    let mut cache = filled(3);

    assert_eq!(cache.get("k0"), Some(0));
    let evicted = cache.put("k3", 3);

    assert_eq!(evicted.as_deref(), Some("k1"));
    assert!(cache.has("k0"));
}

#[test]
fn test_has_does_not_refresh() {
    let mut cache = filled(2);

    assert!(cache.has("k0"));
    assert_eq!(cache.put("k2", 2).as_deref(), Some("k0"));
}

#[test]
fn test_put_existing_refreshes_without_eviction() {
    let mut cache = filled(2);

    assert_eq!(cache.put("k0", 10), None);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.put("k2", 2).as_deref(), Some("k1"));
    assert_eq!(cache.get("k0"), Some(10));
}

#[test]
fn test_zero_capacity_holds_one() {
    let mut cache = LruCache::new(0);

    cache.put("a", 1);
    cache.put("b", 2);

    assert_eq!(cache.capacity(), 1);
    assert_eq!(cache.len(), 1);
    assert!(cache.has("b"));
}

// =============================================================================
// Query Tests
// =============================================================================

#[test]
fn test_all_is_most_recent_first() {
    let mut cache = filled(3);
    cache.get("k1");

    assert_eq!(cache.all(), [1, 2, 0]);
}

#[test]
fn test_find_one_and_remove() {
    let mut cache = filled(4);

    assert_eq!(cache.find_one(|v| *v > 2), Some(3));
    assert_eq!(cache.find_one(|v| *v > 10), None);

    assert_eq!(cache.remove("k3"), Some(3));
    assert_eq!(cache.remove("k3"), None);
    assert_eq!(cache.find_one(|v| *v > 2), None);
}

#[test]
fn test_clear() {
    let mut cache = filled(4);

    cache.clear();

    assert!(cache.is_empty());
    assert_eq!(cache.get("k0"), None);
}
