use super::{CacheEntry, CachedBody};
use crate::config::{EvictionPolicy, TierConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of a single-tier lookup.
///
/// `Stale` means the entry had expired when the read observed it: the tier
/// has already dropped it, but the body is handed back so callers can fall
/// back to it when the upstream is unreachable.
#[derive(Debug)]
pub enum TierLookup {
    Hit(CachedBody),
    Stale(CachedBody),
    Miss,
}

/// Point-in-time counters for one tier
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub size: usize,
}

/// One bounded in-memory cache tier with a TTL and a single eviction policy.
///
/// The internal map is guarded by one mutex held only for map operations;
/// compression and hashing happen outside the lock.
pub struct CacheTier {
    name: &'static str,
    config: TierConfig,
    compression_threshold: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl CacheTier {
    pub fn new(name: &'static str, config: TierConfig, compression_threshold: usize) -> Self {
        Self {
            name,
            config,
            compression_threshold,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
    }

    /// Fetch an entry. A hit bumps `last_accessed_at` and `access_count`
    /// under the lock; an expired entry is removed and returned as stale.
    pub fn get(&self, key: &str) -> TierLookup {
        let mut entries = self.entries.lock().unwrap();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_accessed_at = std::time::Instant::now();
                entry.access_count += 1;
                let snapshot = entry.clone();
                drop(entries);
                self.hits.fetch_add(1, Ordering::Relaxed);
                // Decompression happens outside the lock
                return TierLookup::Hit(CachedBody::from_entry(&snapshot));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            // Observed expiry: the tier must not keep the entry, but the
            // body is still useful to stale-serve callers.
            let entry = entries.remove(key).unwrap();
            drop(entries);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return TierLookup::Stale(CachedBody::from_entry(&entry));
        }

        drop(entries);
        self.misses.fetch_add(1, Ordering::Relaxed);
        TierLookup::Miss
    }

    /// Insert or overwrite an entry. When the tier is full and the key is
    /// new, exactly one entry is evicted per the tier's policy first.
    pub fn put(&self, key: &str, body: Vec<u8>, content_type: &str, ttl: Duration) {
        // Compression runs before taking the lock.
        let entry = CacheEntry::new(
            key.to_string(),
            body,
            content_type.to_string(),
            ttl,
            self.compression_threshold,
        );

        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.config.max_entries && !entries.contains_key(key) {
            if let Some(victim) = self.select_victim(&entries) {
                entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    /// Snapshot of all keys currently stored
    pub fn scan_keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            size: self.entries.lock().unwrap().len(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        drop(entries);

        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Pick the eviction victim per the configured policy.
    ///
    /// LRU evicts the smallest `last_accessed_at`, FIFO the smallest
    /// `created_at`, LFU the smallest `access_count` with
    /// `last_accessed_at` breaking ties.
    fn select_victim(&self, entries: &HashMap<String, CacheEntry>) -> Option<String> {
        let victim = match self.config.policy {
            EvictionPolicy::Lru => entries.values().min_by_key(|e| e.last_accessed_at),
            EvictionPolicy::Fifo => entries.values().min_by_key(|e| e.created_at),
            EvictionPolicy::Lfu => entries
                .values()
                .min_by_key(|e| (e.access_count, e.last_accessed_at)),
        };
        victim.map(|e| e.key.clone())
    }
}
