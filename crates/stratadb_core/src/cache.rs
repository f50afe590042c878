//! Row caches.
//!
//! Two layers: a bounded per-connection LRU cache ([`RowCache`]) and the
//! shared cross-connection cache ([`SharedRowCache`]). Every entry carries
//! the snapshot it was inserted at; the shared cache additionally gates
//! visibility so a connection pinned to an older snapshot never observes a
//! newer cached value.
//!
//! The LRU is arena-based: slots live in a vector, the recency list links
//! slot indices. No pointer-linked nodes.

use crate::types::{RowKey, Snapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratadb_codec::Value;

/// A cached lookup result: a present value, or a confirmed miss.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// The row's deserialized value.
    Present(Arc<Value>),
    /// The row (or its metadata) is known to be absent.
    Absent,
}

#[derive(Debug)]
struct Slot {
    key: RowKey,
    entry: CacheEntry,
    snapshot: Snapshot,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A bounded LRU cache of row values, tagged with insertion snapshots.
///
/// A limit of 0 means unbounded.
#[derive(Debug, Default)]
pub struct RowCache {
    limit: usize,
    map: HashMap<RowKey, usize>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Most recently used slot.
    head: Option<usize>,
    /// Least recently used slot.
    tail: Option<usize>,
}

impl RowCache {
    /// Creates a cache bounded to `limit` entries (0 = unbounded).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Changes the cache limit, evicting least-recently-used entries if the
    /// new limit is smaller than the current size.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        if limit > 0 {
            while self.map.len() > limit {
                self.evict_lru();
            }
        }
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Looks up an entry, marking it most recently used.
    pub fn get(&mut self, key: &RowKey) -> Option<(CacheEntry, Snapshot)> {
        let index = *self.map.get(key)?;
        self.touch(index);
        let slot = self.slots[index].as_ref()?;
        Some((slot.entry.clone(), slot.snapshot))
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, key: RowKey, entry: CacheEntry, snapshot: Snapshot) {
        if let Some(&index) = self.map.get(&key) {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.entry = entry;
                slot.snapshot = snapshot;
            }
            self.touch(index);
            return;
        }

        if self.limit > 0 && self.map.len() >= self.limit {
            self.evict_lru();
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(Slot {
            key: key.clone(),
            entry,
            snapshot,
            prev: None,
            next: self.head,
        });
        if let Some(head) = self.head {
            if let Some(slot) = self.slots[head].as_mut() {
                slot.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        self.map.insert(key, index);
    }

    /// Removes an entry, returning true if it was present.
    pub fn remove(&mut self, key: &RowKey) -> bool {
        let Some(index) = self.map.remove(key) else {
            return false;
        };
        self.unlink(index);
        self.slots[index] = None;
        self.free.push(index);
        true
    }

    /// Removes every entry the predicate rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(&RowKey) -> bool) {
        let doomed: Vec<RowKey> = self
            .map
            .keys()
            .filter(|key| !keep(key))
            .cloned()
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn touch(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        if let Some(slot) = self.slots[index].as_mut() {
            slot.prev = None;
            slot.next = self.head;
        }
        if let Some(head) = self.head {
            if let Some(slot) = self.slots[head].as_mut() {
                slot.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.slots[index].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        match prev {
            Some(prev) => {
                if let Some(slot) = self.slots[prev].as_mut() {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(slot) = self.slots[next].as_mut() {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(slot) = self.slots[index].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.tail {
            let key = self.slots[tail].as_ref().map(|slot| slot.key.clone());
            if let Some(key) = key {
                self.remove(&key);
            }
        }
    }
}

/// The shared cross-connection object cache.
///
/// Entries are visible to a reader only when their snapshot tag is at or
/// below the reader's snapshot: the committing connection refreshes or
/// removes affected entries at commit time, so an entry tagged `S` is
/// guaranteed unchanged between `S` and the latest commit.
pub struct SharedRowCache {
    inner: Mutex<RowCache>,
}

impl SharedRowCache {
    /// Creates a shared cache bounded to `limit` entries (0 = unbounded).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(RowCache::new(limit)),
        }
    }

    /// Looks up an entry visible to a reader at `snapshot`.
    pub fn get(&self, key: &RowKey, snapshot: Snapshot) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let (entry, tag) = inner.get(key)?;
        if tag <= snapshot {
            Some(entry)
        } else {
            None
        }
    }

    /// Inserts an entry tagged with the snapshot it was read or written at.
    ///
    /// A newer tag always wins; an older insert never clobbers a newer
    /// entry.
    pub fn insert(&self, key: RowKey, entry: CacheEntry, snapshot: Snapshot) {
        let mut inner = self.inner.lock();
        if let Some((_, existing)) = inner.get(&key) {
            if existing > snapshot {
                return;
            }
        }
        inner.insert(key, entry, snapshot);
    }

    /// Removes the entry for a key.
    pub fn remove(&self, key: &RowKey) {
        self.inner.lock().remove(key);
    }

    /// Removes every entry the predicate rejects.
    pub fn retain(&self, keep: impl FnMut(&RowKey) -> bool) {
        self.inner.lock().retain(keep);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for SharedRowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRowCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> RowKey {
        RowKey::new("c", name)
    }

    fn present(n: i64) -> CacheEntry {
        CacheEntry::Present(Arc::new(Value::Integer(n)))
    }

    fn entry_value(entry: &CacheEntry) -> Option<i64> {
        match entry {
            CacheEntry::Present(v) => v.as_integer(),
            CacheEntry::Absent => None,
        }
    }

    #[test]
    fn insert_get_roundtrip() {
        let mut cache = RowCache::new(10);
        cache.insert(key("a"), present(1), Snapshot::new(1));
        let (entry, snapshot) = cache.get(&key("a")).unwrap();
        assert_eq!(entry_value(&entry), Some(1));
        assert_eq!(snapshot, Snapshot::new(1));
        assert!(cache.get(&key("b")).is_none());
    }

    #[test]
    fn lru_eviction_order() {
        let mut cache = RowCache::new(2);
        cache.insert(key("a"), present(1), Snapshot::new(1));
        cache.insert(key("b"), present(2), Snapshot::new(1));
        // Touch "a" so "b" becomes least recently used.
        cache.get(&key("a"));
        cache.insert(key("c"), present(3), Snapshot::new(1));

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn unbounded_when_limit_zero() {
        let mut cache = RowCache::new(0);
        for i in 0..1000 {
            cache.insert(key(&format!("k{i}")), present(i), Snapshot::new(1));
        }
        assert_eq!(cache.len(), 1000);
    }

    #[test]
    fn replace_updates_snapshot() {
        let mut cache = RowCache::new(10);
        cache.insert(key("a"), present(1), Snapshot::new(1));
        cache.insert(key("a"), present(2), Snapshot::new(5));
        let (entry, snapshot) = cache.get(&key("a")).unwrap();
        assert_eq!(entry_value(&entry), Some(2));
        assert_eq!(snapshot, Snapshot::new(5));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn retain_filters_entries() {
        let mut cache = RowCache::new(10);
        cache.insert(RowKey::new("a", "1"), present(1), Snapshot::new(1));
        cache.insert(RowKey::new("b", "1"), present(2), Snapshot::new(1));
        cache.retain(|key| key.collection != "a");
        assert!(cache.get(&RowKey::new("a", "1")).is_none());
        assert!(cache.get(&RowKey::new("b", "1")).is_some());
    }

    #[test]
    fn remove_and_reuse_slot() {
        let mut cache = RowCache::new(10);
        cache.insert(key("a"), present(1), Snapshot::new(1));
        assert!(cache.remove(&key("a")));
        assert!(!cache.remove(&key("a")));
        cache.insert(key("b"), present(2), Snapshot::new(1));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("b")).is_some());
    }

    #[test]
    fn shared_cache_gates_by_snapshot() {
        let cache = SharedRowCache::new(10);
        cache.insert(key("a"), present(1), Snapshot::new(5));

        // A reader at an older snapshot must not see the newer entry.
        assert!(cache.get(&key("a"), Snapshot::new(3)).is_none());
        // A reader at or past the tag sees it.
        assert!(cache.get(&key("a"), Snapshot::new(5)).is_some());
        assert!(cache.get(&key("a"), Snapshot::new(9)).is_some());
    }

    #[test]
    fn shared_cache_newer_tag_wins() {
        let cache = SharedRowCache::new(10);
        cache.insert(key("a"), present(2), Snapshot::new(5));
        // A stale insert (e.g. a slow reader) must not clobber it.
        cache.insert(key("a"), present(1), Snapshot::new(2));
        let entry = cache.get(&key("a"), Snapshot::new(5)).unwrap();
        assert_eq!(entry_value(&entry), Some(2));
    }
}
