//! Bounded most-recently-used cache with insertion timestamps.
//!
//! [`MruCache`] backs both tiers of the value store and the connection
//! broker's live-session window. Recency is write-driven: `add` moves an
//! entry to the tail, `try_get` is a pure read and never reorders. Each
//! entry remembers when it was (re)inserted so expiry can drop the aged
//! prefix in one pass.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

pub struct MruCache<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
}

impl<K: Hash + Eq + Clone, V> MruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).expect("capacity must be non-zero");
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// A cache bounded only by age, never by entry count.
    pub fn unbounded() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }

    /// Insert or refresh an entry at the tail with a fresh timestamp.
    ///
    /// Returns the key evicted to make room, if the insert displaced a
    /// different entry. Re-adding an existing key only moves it.
    pub fn add(&mut self, key: K, value: V) -> Option<K> {
        let entry = Entry {
            value,
            stored_at: Instant::now(),
        };
        match self.entries.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }

    /// Read without touching recency.
    pub fn try_get(&self, key: &K) -> Option<&V> {
        self.entries.peek(key).map(|entry| &entry.value)
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.pop(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Drop every entry older than `max_age`, oldest first, stopping at the
    /// first survivor. Returns how many entries were removed.
    pub fn expire_old(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        while let Some((_, entry)) = self.entries.peek_lru() {
            if now.duration_since(entry.stored_at) > max_age {
                self.entries.pop_lru();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insertion timestamp of the oldest entry.
    pub fn oldest_timestamp(&self) -> Option<Instant> {
        self.entries.peek_lru().map(|(_, entry)| entry.stored_at)
    }

    /// Iterate entries, most recent first. Does not touch recency.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, entry)| (k, &entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_evicts_the_first_inserted() {
        let mut cache = MruCache::new(4);
        for i in 0u32..4 {
            assert_eq!(cache.add(i, i * 10), None);
        }
        let evicted = cache.add(4u32, 40);
        assert_eq!(evicted, Some(0));
        assert_eq!(cache.len(), 4);
        assert!(!cache.contains(&0));
        assert!(cache.contains(&4));
    }

    #[test]
    fn re_adding_refreshes_instead_of_evicting() {
        let mut cache = MruCache::new(2);
        cache.add("a", 1);
        cache.add("b", 2);
        // "a" moves to the tail; nothing is displaced.
        assert_eq!(cache.add("a", 3), None);
        // Overflow now evicts "b", the stale head.
        assert_eq!(cache.add("c", 4), Some("b"));
        assert_eq!(cache.try_get(&"a"), Some(&3));
    }

    #[test]
    fn try_get_never_changes_position() {
        let mut cache = MruCache::new(2);
        cache.add("a", 1);
        cache.add("b", 2);
        // Reading "a" must not rescue it from the head.
        assert_eq!(cache.try_get(&"a"), Some(&1));
        assert_eq!(cache.add("c", 3), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_exactly_the_aged_prefix() {
        let mut cache = MruCache::new(8);
        cache.add("old1", 1);
        cache.add("old2", 2);
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.add("fresh", 3);

        let removed = cache.expire_old(Duration::from_secs(2));
        assert_eq!(removed, 2, "both aged entries must go, nothing else");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&"fresh"));
        assert!(!cache.contains(&"old1"));
        assert!(!cache.contains(&"old2"));
    }

    #[tokio::test(start_paused = true)]
    async fn survivors_are_all_young_enough() {
        let mut cache = MruCache::unbounded();
        for i in 0u32..10 {
            cache.add(i, i);
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        let max_age = Duration::from_millis(1800);
        cache.expire_old(max_age);
        let now = Instant::now();
        assert!(cache.len() > 0);
        let oldest = cache.oldest_timestamp().expect("non-empty");
        assert!(now.duration_since(oldest) <= max_age);
    }

    #[test]
    fn oldest_timestamp_tracks_the_head() {
        let mut cache = MruCache::new(4);
        assert!(cache.oldest_timestamp().is_none());
        cache.add(1u8, ());
        let first = cache.oldest_timestamp().expect("one entry");
        cache.add(2u8, ());
        assert_eq!(cache.oldest_timestamp(), Some(first));
        cache.remove(&1);
        assert!(cache.oldest_timestamp().expect("one entry") >= first);
    }
}
