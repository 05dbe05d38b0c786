//! SHA-256 keyed result cache with TTL and byte-budgeted LRU eviction

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sqlhub_core::{Row, Value};

/// A cached component result
#[derive(Debug, Clone)]
pub struct CachedComponent {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total_rows: u64,
}

struct CacheEntry {
    result: Arc<CachedComponent>,
    expires_at: Instant,
    size_bytes: u64,
    hit_count: u64,
    /// Monotonic recency stamp; smallest is the LRU victim
    last_access: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    access_counter: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Counter snapshot for the stats endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportCacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Compute the cache key for a component run.
///
/// `SHA-256(component_id ∥ normalized_query ∥ canonical_filters)`; the
/// query is whitespace-normalized so formatting differences share one
/// entry.
pub fn cache_key(component_id: &str, query: &str, filters: &BTreeMap<String, String>) -> String {
    let normalized_query = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut canonical_filters = String::new();
    for (key, value) in filters {
        canonical_filters.push_str(key);
        canonical_filters.push('=');
        canonical_filters.push_str(value);
        canonical_filters.push(';');
    }

    let mut hasher = Sha256::new();
    hasher.update(component_id.as_bytes());
    hasher.update([0]);
    hasher.update(normalized_query.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_filters.as_bytes());
    hex::encode(hasher.finalize())
}

/// Estimate the in-memory weight of a cached result
fn estimate_size(result: &CachedComponent) -> u64 {
    let mut size = 64u64;
    for column in &result.columns {
        size += column.len() as u64 + 16;
    }
    for row in &result.rows {
        for value in &row.values {
            size += match value {
                Value::Null => 8,
                Value::Bool(_) => 8,
                Value::Int(_) | Value::Float(_) => 16,
                Value::Decimal(s) | Value::Text(s) | Value::Interval(s) => s.len() as u64 + 24,
                Value::Bytes(b) => b.len() as u64 + 24,
                Value::Uuid(_) => 24,
                Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => 24,
                Value::Json(j) => j.to_string().len() as u64 + 24,
            };
        }
    }
    size
}

/// Process-wide report result cache.
///
/// `get` drops expired entries on sight; `set` evicts least-recently-used
/// entries until the new entry fits under the byte budget. After every
/// insert the total size stays at or under `max_bytes`.
pub struct ReportCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
}

impl ReportCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
                access_counter: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_bytes,
        }
    }

    /// Look up a key, expiring it if its TTL has passed
    pub fn get(&self, key: &str) -> Option<Arc<CachedComponent>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            let entry = inner.entries.remove(key).expect("checked above");
            inner.total_bytes -= entry.size_bytes;
            inner.misses += 1;
            tracing::debug!(key = %key, "cache entry expired");
            return None;
        }

        inner.access_counter += 1;
        let stamp = inner.access_counter;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_access = stamp;
                let result = Arc::clone(&entry.result);
                inner.hits += 1;
                Some(result)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a result, evicting LRU entries until it fits.
    ///
    /// A result larger than the whole budget is not cached at all.
    pub fn set(&self, key: String, result: CachedComponent, ttl: Duration) {
        let size_bytes = estimate_size(&result);
        if size_bytes > self.max_bytes {
            tracing::warn!(
                size_bytes = size_bytes,
                max_bytes = self.max_bytes,
                "result larger than the cache budget, not caching"
            );
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.remove(&key) {
            inner.total_bytes -= previous.size_bytes;
        }

        while inner.total_bytes + size_bytes > self.max_bytes {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            let entry = inner.entries.remove(&victim).expect("victim exists");
            inner.total_bytes -= entry.size_bytes;
            inner.evictions += 1;
            tracing::debug!(key = %victim, "evicted LRU cache entry");
        }

        inner.access_counter += 1;
        let stamp = inner.access_counter;
        inner.total_bytes += size_bytes;
        inner.entries.insert(
            key,
            CacheEntry {
                result: Arc::new(result),
                expires_at: Instant::now() + ttl,
                size_bytes,
                hit_count: 0,
                last_access: stamp,
            },
        );
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn stats(&self) -> ReportCacheStats {
        let inner = self.inner.lock();
        ReportCacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_of_size(text_len: usize) -> CachedComponent {
        CachedComponent {
            columns: vec!["v".into()],
            rows: vec![Row::new(
                vec!["v".into()],
                vec![Value::Text("x".repeat(text_len))],
            )],
            total_rows: 1,
        }
    }

    #[test]
    fn test_key_is_stable_under_whitespace_and_filter_order() {
        let mut a = BTreeMap::new();
        a.insert("from".to_string(), "2026-01-01".to_string());
        a.insert("team".to_string(), "core".to_string());

        let mut b = BTreeMap::new();
        b.insert("team".to_string(), "core".to_string());
        b.insert("from".to_string(), "2026-01-01".to_string());

        let key_a = cache_key("c1", "SELECT  *\n FROM t", &a);
        let key_b = cache_key("c1", "SELECT * FROM t", &b);
        assert_eq!(key_a, key_b);

        let other = cache_key("c2", "SELECT * FROM t", &a);
        assert_ne!(key_a, other);
    }

    #[test]
    fn test_hit_and_expiry() {
        let cache = ReportCache::new(1024 * 1024);
        cache.set("k".into(), result_of_size(10), Duration::from_millis(30));

        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_lru_eviction_respects_budget() {
        // Each entry weighs a bit over 100 bytes; budget fits two.
        let cache = ReportCache::new(400);
        cache.set("a".into(), result_of_size(60), Duration::from_secs(60));
        cache.set("b".into(), result_of_size(60), Duration::from_secs(60));

        // Touch `a` so `b` becomes the LRU victim.
        assert!(cache.get("a").is_some());
        cache.set("c".into(), result_of_size(60), Duration::from_secs(60));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());

        let stats = cache.stats();
        assert!(stats.total_bytes <= stats.max_bytes);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_oversized_result_is_not_cached() {
        let cache = ReportCache::new(100);
        cache.set("big".into(), result_of_size(500), Duration::from_secs(60));
        assert!(cache.get("big").is_none());
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[test]
    fn test_replacing_a_key_reclaims_its_size() {
        let cache = ReportCache::new(10_000);
        cache.set("k".into(), result_of_size(500), Duration::from_secs(60));
        let first = cache.stats().total_bytes;
        cache.set("k".into(), result_of_size(500), Duration::from_secs(60));
        assert_eq!(cache.stats().total_bytes, first);
        assert_eq!(cache.stats().entries, 1);
    }
}
