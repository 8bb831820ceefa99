use dashmap::DashMap;
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cache entry tagged with its own expiry.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Concurrent map whose entries expire independently.
///
/// Expiry is checked lazily on every read, and [`TtlCache::spawn_sweeper`]
/// can run a background task that drops expired entries nobody asks for.
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash, V> {
    data: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_removals: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            data: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_removals: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> Option<V> {
        self.data
            .insert(key, CacheEntry::new(value, ttl))
            .map(|old| old.value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        // remove_if takes the shard write lock, so a concurrent insert of a
        // fresh value for the same key is never dropped by mistake.
        if self
            .data
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.expired_removals.fetch_add(1, Ordering::Relaxed);
        }

        match self.data.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drops expired entries and returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            self.expired_removals
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("🧹 Swept {} expired cache entries", removed);
        }

        removed
    }

    /// Runs [`cleanup_expired`](Self::cleanup_expired) every `every` until
    /// `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.cleanup_expired();
                        debug!("📊 Resolution cache: {}", cache.metrics());
                    }
                }
            }
        })
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_removals: self.expired_removals.load(Ordering::Relaxed),
            entries: self.data.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub expired_removals: u64,
    pub entries: usize,
}

impl std::fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entries, {:.1}% hits ({} hits, {} misses, {} expired)",
            self.entries,
            self.hit_rate() * 100.0,
            self.hits,
            self.misses,
            self.expired_removals
        )
    }
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_invisible_on_read() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("a", 1);
        cache.insert_with_ttl("b", 2, Duration::from_secs(60));

        assert_eq!(cache.get(&"a"), Some(1));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cleanup_only_drops_expired() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("old", 1);
        cache.insert_with_ttl("fresh", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.get(&"fresh"), Some(2));
    }

    #[test]
    fn metrics_count_hits_and_misses() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(1u8, "x");
        cache.get(&1);
        cache.get(&1);
        cache.get(&2);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(metrics.to_string(), "1 entries, 66.7% hits (2 hits, 1 misses, 0 expired)");
    }

    #[tokio::test]
    async fn sweeper_removes_entries_in_background() {
        let cache = Arc::new(TtlCache::new(Duration::from_millis(10)));
        cache.insert("gone", 1);
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(15), cancel.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.expect("sweeper exits cleanly");
    }

    #[tokio::test]
    async fn concurrent_inserts_and_reads_do_not_lose_entries() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let tasks: Vec<_> = (0..16u32)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for j in 0..100u32 {
                        cache.insert(i * 1000 + j, j);
                        assert_eq!(cache.get(&(i * 1000 + j)), Some(j));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task completes");
        }
        assert_eq!(cache.len(), 1600);
    }
}
