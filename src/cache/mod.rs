
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// In-process memoization of recent query results, bounded by entry count
/// and age. Entries are cloned out, so values should be cheap to clone.
///
/// Ingestion and deletion invalidate the whole cache rather than tracking
/// which cached results a document contributed to.
#[derive(Debug)]
pub struct QueryCache<V> {
    inner: Mutex<HashMap<String, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: Instant,
}

impl<V: Clone> QueryCache<V> {
    #[inline]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Fetch a live entry, refreshing its recency. Expired entries are
    /// removed on the way out.
    #[inline]
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get_mut(key) {
            if entry.inserted_at.elapsed() > self.ttl {
                entries.remove(key);
                return None;
            }
            entry.last_used = Instant::now();
            return Some(entry.value.clone());
        }

        None
    }

    #[inline]
    pub fn insert(&self, key: String, value: V) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        entries.retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            // Evict the least recently used entry to make room.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_used: now,
            },
        );
    }

    /// Drop everything. Called whenever the index changes so stale results
    /// never outlive the data they were computed from.
    #[inline]
    pub fn invalidate_all(&self) {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = entries.len();
        entries.clear();
        if dropped > 0 {
            debug!("Invalidated {} cached query results", dropped);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
