use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Cached value with its insertion time and lifetime.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
    /// `ETag` of the cached response, if the server sent one.
    pub etag: Option<String>,
}

impl<T> CacheEntry<T> {
    /// Whether the entry has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Bounded key/value store with per-entry TTL.
///
/// Expired entries are dropped lazily on read. When full, inserting a new
/// key evicts the oldest-inserted key; reads do not refresh position.
#[derive(Debug)]
pub struct ResponseCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    order: VecDeque<String>,
    max_size: usize,
    default_ttl: Duration,
}

impl<T: Clone> ResponseCache<T> {
    /// Creates a cache holding at most `max_size` entries (minimum one).
    ///
    /// `default_ttl` applies to entries stored without an explicit TTL.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// Stores `data`, replacing any existing entry for `key` wholesale.
    ///
    /// An overwritten key keeps its place in the eviction order. A new key
    /// inserted at capacity evicts the oldest one.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        data: T,
        ttl: Option<Duration>,
        etag: Option<String>,
    ) {
        let key = key.into();
        let entry = CacheEntry {
            data,
            inserted_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            etag,
        };

        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push_back(key);
            while self.entries.len() > self.max_size {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    /// Returns a copy of the value, or `None` if absent or expired.
    pub fn get(&mut self, key: &str) -> Option<T> {
        self.get_entry(key).map(|entry| entry.data)
    }

    /// Returns the full entry, e.g. for ETag comparisons.
    pub fn get_entry(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let expired = self.entries.get(key)?.is_expired();
        if expired {
            self.delete(key);
            return None;
        }
        self.entries.get(key).cloned()
    }

    /// Removes `key`, reporting whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.order.retain(|existing| existing != key);
        }
        removed
    }

    /// Deletes every key for which `predicate` holds and returns how many went.
    pub fn delete_matching(&mut self, predicate: impl Fn(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        self.order.retain(|key| !predicate(key));
        before - self.entries.len()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Keys in insertion order, expired ones included until they are read.
    pub fn keys(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}
