//! Recency cache of block timestamps.
//!
//! Transfers cluster in the same blocks, so a small cache avoids most header
//! lookups while scanning history.

use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;

pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 25;

pub struct BlockTimeCache {
    entries: LruCache<u64, DateTime<Utc>>,
}

impl BlockTimeCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Looks up a block and marks it as most recently used.
    pub fn get(&mut self, block: u64) -> Option<DateTime<Utc>> {
        self.entries.get(&block).copied()
    }

    /// Evicts the least recently used entry when full.
    pub fn put(&mut self, block: u64, time: DateTime<Utc>) {
        self.entries.put(block, time);
    }

    pub fn contains(&self, block: u64) -> bool {
        self.entries.contains(&block)
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
}

impl Default for BlockTimeCache {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_get_and_put() {
        let mut cache = BlockTimeCache::default();
        assert_eq!(cache.capacity(), 25);
        assert!(cache.get(1).is_none());

        cache.put(1, ts(1_000));
        assert_eq!(cache.get(1), Some(ts(1_000)));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut cache = BlockTimeCache::new(3);
        for block in 0..10 {
            cache.put(block, ts(block as i64));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(9));
        assert!(!cache.contains(6));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = BlockTimeCache::new(2);
        cache.put(10, ts(10));
        cache.put(11, ts(11));

        // Touch 10 so that 11 becomes the eviction candidate.
        assert!(cache.get(10).is_some());
        cache.put(12, ts(12));

        assert!(cache.contains(10));
        assert!(!cache.contains(11));
        assert!(cache.contains(12));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut cache = BlockTimeCache::new(0);
        cache.put(1, ts(1));
        cache.put(2, ts(2));
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(2));
    }
}
