//! # Route Cache
//!
//! A bounded, time-windowed cache for resolved route segments.
//!
//! Entries are evicted oldest-inserted first when the cache is full, and are
//! treated as absent once older than the configured TTL. Staleness is checked
//! lazily on lookup; there is no background sweep.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::geo_utils::round_coordinate;
use crate::GpsPoint;

/// Cache key for a segment: both endpoints rounded to ~1 m.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    start: (i64, i64),
    end: (i64, i64),
}

impl SegmentKey {
    pub fn new(start: &GpsPoint, end: &GpsPoint) -> Self {
        Self {
            start: (
                round_coordinate(start.latitude),
                round_coordinate(start.longitude),
            ),
            end: (round_coordinate(end.latitude), round_coordinate(end.longitude)),
        }
    }
}

/// Insertion-ordered cache with a fixed capacity and per-entry TTL.
///
/// Capacity is small (100 segments by default), so eviction scans linearly
/// instead of maintaining a separate ordering structure.
#[derive(Debug)]
pub struct RouteCache<K, V> {
    capacity: usize,
    ttl: chrono::Duration,
    entries: HashMap<K, CacheEntry<V>>,
    insert_counter: u64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    sequence: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> RouteCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000)),
            entries: HashMap::with_capacity(capacity),
            insert_counter: 0,
        }
    }

    /// Look up a fresh entry. A stale entry is dropped and reported as a miss.
    pub fn get(&mut self, key: &K, now: DateTime<Utc>) -> Option<&V> {
        let stale = match self.entries.get(key) {
            Some(entry) => now - entry.inserted_at > self.ttl,
            None => return None,
        };
        if stale {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Get a cloned value from the cache (useful when you can't hold a reference).
    pub fn get_cloned(&mut self, key: &K, now: DateTime<Utc>) -> Option<V> {
        self.get(key, now).cloned()
    }

    /// Insert a value stamped with `now`, evicting the oldest insert if full.
    ///
    /// Re-inserting an existing key refreshes both its value and its age.
    pub fn insert(&mut self, key: K, value: V, now: DateTime<Utc>) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        self.insert_counter += 1;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                sequence: self.insert_counter,
            },
        );
    }

    /// Remove a specific key from the cache.
    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Clear all entries from the cache.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.insert_counter = 0;
    }

    /// Number of stored entries, stale ones included until looked up.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check presence without applying the TTL.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn evict_oldest(&mut self) {
        let oldest_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.sequence)
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest_key {
            self.entries.remove(&key);
        }
    }
}
