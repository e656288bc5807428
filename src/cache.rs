// 🧊 Shadow Cache - Optional, never authoritative
//
// Entries are tagged with the store revision they were computed at. A hit
// whose revision no longer matches the store is treated as a miss, so a
// stale or absent cache can only cost a recomputation.

use crate::db::StorageContext;
use crate::deadline::Deadline;
use crate::error::Result;
use moka::sync::Cache as MokaCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Key-value store that may shadow `get`/`translate` results
pub trait ShadowCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: String, value: String);
}

/// In-process cache bounded by entry count. Eviction is moka's
/// frequency-aware LRU, so a full cache drops cold keys one at a time.
#[derive(Clone)]
pub struct MemoryCache {
    entries: MokaCache<String, String>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        MemoryCache {
            entries: MokaCache::new(capacity.max(1) as u64),
        }
    }

    /// Entries currently held, after pending evictions are applied
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        MemoryCache::new(10_000)
    }
}

impl ShadowCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key)
    }

    fn put(&self, key: String, value: String) {
        self.entries.insert(key, value);
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    revision: i64,
    payload: T,
}

/// Serve `key` from the cache when it was computed at the current store
/// revision, otherwise compute and store it.
///
/// The revision is read before computing: a write that lands in between
/// leaves the entry tagged older than its content, which only causes a miss.
pub(crate) fn cached<T, F>(
    cache: Option<&dyn ShadowCache>,
    store: &StorageContext,
    key: &str,
    deadline: &Deadline,
    compute: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T>,
{
    let Some(cache) = cache else {
        return compute();
    };

    let revision = store.revision(deadline)?;

    if let Some(raw) = cache.get(key) {
        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(envelope) if envelope.revision == revision => {
                tracing::debug!(key, revision, "shadow cache hit");
                return Ok(envelope.payload);
            }
            Ok(_) => tracing::debug!(key, revision, "shadow cache entry is stale"),
            Err(err) => tracing::debug!(key, error = %err, "shadow cache entry unreadable"),
        }
    }

    let payload = compute()?;
    match serde_json::to_string(&Envelope { revision, payload: &payload }) {
        Ok(raw) => cache.put(key.to_string(), raw),
        Err(err) => tracing::warn!(key, error = %err, "could not serialize cache entry"),
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_memory_cache_stays_within_capacity() {
        let cache = MemoryCache::new(8);
        for i in 0..64 {
            cache.put(format!("k{}", i), i.to_string());
        }
        let held = cache.len();
        assert!(held > 0 && held <= 8, "held {} entries", held);
    }

    #[test]
    fn test_memory_cache_overwrite_keeps_one_entry() {
        let cache = MemoryCache::new(4);
        cache.put("a".into(), "1".into());
        cache.put("a".into(), "2".into());
        cache.put("b".into(), "3".into());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("2"));

        cache.clear();
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_cached_recomputes_after_store_write() {
        let store = StorageContext::open_in_memory().unwrap();
        let cache = MemoryCache::default();
        let deadline = Deadline::none();
        let calls = Cell::new(0);

        let compute = || {
            calls.set(calls.get() + 1);
            Ok(calls.get())
        };

        assert_eq!(cached(Some(&cache), &store, "k", &deadline, compute).unwrap(), 1);
        assert_eq!(cached(Some(&cache), &store, "k", &deadline, compute).unwrap(), 1);
        assert_eq!(calls.get(), 1);

        store.write(&deadline, |_| Ok(())).unwrap();

        assert_eq!(cached(Some(&cache), &store, "k", &deadline, compute).unwrap(), 2);
    }

    #[test]
    fn test_garbage_entry_is_a_miss() {
        let store = StorageContext::open_in_memory().unwrap();
        let cache = MemoryCache::default();
        cache.put("k".into(), "not json".into());

        let value: String =
            cached(Some(&cache), &store, "k", &Deadline::none(), || Ok("fresh".to_string())).unwrap();
        assert_eq!(value, "fresh");
    }
}
