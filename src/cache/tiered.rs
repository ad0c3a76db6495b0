use super::tier::{CacheTier, TierLookup, TierStats};
use super::CachedBody;
use crate::config::CacheSettings;
use crate::error::{ProxyError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a tiered lookup
#[derive(Debug)]
pub enum Lookup {
    /// Fresh entry found; `tier` names the tier that answered (L1/L2/L3)
    Hit { body: CachedBody, tier: &'static str },
    /// Only an expired body was found; it has been dropped from its tier
    /// and is suitable solely as a fallback when upstream is unreachable
    Stale { body: CachedBody, tier: &'static str },
    Miss,
}

/// Three-tier cache probed in L1 → L2 → L3 order with promotion on read.
///
/// Tier locks are only ever taken one at a time, in ascending order, so
/// promotion cannot deadlock against concurrent probes.
pub struct TieredCache {
    tiers: Vec<Arc<CacheTier>>,
}

impl TieredCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let threshold = settings.compression_threshold;
        let all = [
            Arc::new(CacheTier::new("L1", settings.l1.clone(), threshold)),
            Arc::new(CacheTier::new("L2", settings.l2.clone(), threshold)),
            Arc::new(CacheTier::new("L3", settings.l3.clone(), threshold)),
        ];

        Self {
            tiers: all.into_iter().filter(|t| t.is_enabled()).collect(),
        }
    }

    /// Probe tiers in order. The first fresh hit wins and is promoted into
    /// every faster tier using that tier's own default TTL. An expired body
    /// observed along the way is remembered and returned as `Stale` only if
    /// no deeper tier has a fresh copy.
    pub fn get(&self, key: &str) -> Lookup {
        let mut stale: Option<(CachedBody, &'static str)> = None;

        for (level, tier) in self.tiers.iter().enumerate() {
            match tier.get(key) {
                TierLookup::Hit(body) => {
                    if level > 0 {
                        self.promote(key, &body, level);
                    }
                    return Lookup::Hit {
                        body,
                        tier: tier.name(),
                    };
                }
                TierLookup::Stale(body) => {
                    if stale.is_none() {
                        stale = Some((body, tier.name()));
                    }
                }
                TierLookup::Miss => {}
            }
        }

        match stale {
            Some((body, tier)) => Lookup::Stale { body, tier },
            None => Lookup::Miss,
        }
    }

    /// Copy a hit into all faster tiers. Promotion resets the TTL to each
    /// destination tier's default rather than carrying the source's
    /// remaining lifetime.
    fn promote(&self, key: &str, body: &CachedBody, found_at: usize) {
        for tier in &self.tiers[..found_at] {
            tier.put(
                key,
                body.body.clone(),
                &body.content_type,
                tier.default_ttl(),
            );
        }
    }

    /// Write an entry into every enabled tier, using the explicit TTL when
    /// given and each tier's default otherwise.
    pub fn put(&self, key: &str, body: &[u8], content_type: &str, explicit_ttl: Option<Duration>) {
        for tier in &self.tiers {
            let ttl = explicit_ttl.unwrap_or_else(|| tier.default_ttl());
            tier.put(key, body.to_vec(), content_type, ttl);
        }
    }

    /// Remove a key from every tier; true if any tier held it
    pub fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in &self.tiers {
            removed |= tier.delete(key);
        }
        removed
    }

    /// Delete every key matching `pattern` (a regular expression) from all
    /// tiers. Returns the number of unique keys removed.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        let re = Regex::new(pattern)
            .map_err(|e| ProxyError::BadRequest(format!("invalid invalidation pattern: {e}")))?;

        let mut deleted: HashSet<String> = HashSet::new();
        for tier in &self.tiers {
            for key in tier.scan_keys() {
                if re.is_match(&key) && tier.delete(&key) {
                    deleted.insert(key);
                }
            }
        }

        Ok(deleted.len())
    }

    /// Sweep expired entries out of every tier
    pub fn cleanup_expired(&self) -> usize {
        self.tiers.iter().map(|t| t.cleanup_expired()).sum()
    }

    /// Per-tier statistics, in tier order
    pub fn stats(&self) -> Vec<(&'static str, TierStats)> {
        self.tiers.iter().map(|t| (t.name(), t.stats())).collect()
    }

    /// Direct tier access, used by tests and the stats endpoint
    pub fn tier(&self, name: &str) -> Option<&Arc<CacheTier>> {
        self.tiers.iter().find(|t| t.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicy, TierConfig};

    fn settings() -> CacheSettings {
        let tier = |ttl: u64, policy| TierConfig {
            enabled: true,
            max_entries: 10,
            default_ttl_seconds: ttl,
            policy,
        };
        CacheSettings {
            l1: tier(1, EvictionPolicy::Lru),
            l2: tier(60, EvictionPolicy::Fifo),
            l3: tier(3600, EvictionPolicy::Lfu),
            compression_threshold: 0,
        }
    }

    fn put_only(cache: &TieredCache, tier: &str, key: &str, body: &[u8], ttl: Duration) {
        cache
            .tier(tier)
            .unwrap()
            .put(key, body.to_vec(), "application/json", ttl);
    }

    #[test]
    fn put_populates_every_tier() {
        let cache = TieredCache::new(&settings());
        cache.put("k", b"v", "application/json", None);

        for name in ["L1", "L2", "L3"] {
            assert_eq!(cache.tier(name).unwrap().len(), 1, "missing in {name}");
        }
    }

    #[test]
    fn first_tier_hit_wins() {
        let cache = TieredCache::new(&settings());
        cache.put("k", b"v", "application/json", None);

        match cache.get("k") {
            Lookup::Hit { body, tier } => {
                assert_eq!(tier, "L1");
                assert_eq!(body.body, b"v");
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn l2_hit_promotes_to_l1_only() {
        let cache = TieredCache::new(&settings());
        put_only(&cache, "L2", "k", b"v", Duration::from_secs(60));

        match cache.get("k") {
            Lookup::Hit { tier, .. } => assert_eq!(tier, "L2"),
            other => panic!("expected hit, got {other:?}"),
        }

        assert_eq!(cache.tier("L1").unwrap().len(), 1);
        // Promotion never propagates downward
        assert_eq!(cache.tier("L3").unwrap().len(), 0);
    }

    #[test]
    fn l3_hit_promotes_to_l1_and_l2() {
        let cache = TieredCache::new(&settings());
        put_only(&cache, "L3", "k", b"v", Duration::from_secs(3600));

        match cache.get("k") {
            Lookup::Hit { tier, .. } => assert_eq!(tier, "L3"),
            other => panic!("expected hit, got {other:?}"),
        }

        assert_eq!(cache.tier("L1").unwrap().len(), 1);
        assert_eq!(cache.tier("L2").unwrap().len(), 1);
    }

    #[test]
    fn promotion_uses_destination_tier_ttl() {
        let cache = TieredCache::new(&settings());
        put_only(&cache, "L3", "k", b"v", Duration::from_secs(3600));

        assert!(matches!(cache.get("k"), Lookup::Hit { tier: "L3", .. }));

        // L1's default TTL is 1s in this fixture; the L3 source had ~1h
        // left. After 1.2s the promoted copy must be gone from L1 while L3
        // still answers.
        std::thread::sleep(Duration::from_millis(1200));
        match cache.tier("L1").unwrap().get("k") {
            TierLookup::Stale(_) | TierLookup::Miss => {}
            TierLookup::Hit(_) => panic!("promoted entry outlived destination TTL"),
        }
        assert!(matches!(
            cache.tier("L3").unwrap().get("k"),
            TierLookup::Hit(_)
        ));
    }

    #[test]
    fn expired_everywhere_returns_stale_and_clears_tiers() {
        let cache = TieredCache::new(&settings());
        cache.put("k", b"v", "application/json", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));

        match cache.get("k") {
            Lookup::Stale { body, tier } => {
                assert_eq!(body.body, b"v");
                assert_eq!(tier, "L1");
            }
            other => panic!("expected stale, got {other:?}"),
        }

        // Every tier dropped its expired copy during the probe
        for name in ["L1", "L2", "L3"] {
            assert_eq!(cache.tier(name).unwrap().len(), 0);
        }
        assert!(matches!(cache.get("k"), Lookup::Miss));
    }

    #[test]
    fn fresh_deeper_copy_beats_stale_shallow_copy() {
        let cache = TieredCache::new(&settings());
        put_only(&cache, "L1", "k", b"old", Duration::from_millis(1));
        put_only(&cache, "L3", "k", b"fresh", Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(10));

        match cache.get("k") {
            Lookup::Hit { body, tier } => {
                assert_eq!(tier, "L3");
                assert_eq!(body.body, b"fresh");
            }
            other => panic!("expected L3 hit, got {other:?}"),
        }
    }

    #[test]
    fn delete_removes_from_all_tiers() {
        let cache = TieredCache::new(&settings());
        cache.put("k", b"v", "application/json", None);

        assert!(cache.delete("k"));
        assert!(matches!(cache.get("k"), Lookup::Miss));
        assert!(!cache.delete("k"));
    }

    #[test]
    fn invalidate_counts_unique_keys() {
        let cache = TieredCache::new(&settings());
        cache.put("tournaments:aaa", b"1", "application/json", None);
        cache.put("tournaments:bbb", b"2", "application/json", None);
        cache.put("rankings:ccc", b"3", "application/json", None);

        // Each key lives in three tiers but counts once
        let deleted = cache.invalidate("^tournaments:").unwrap();
        assert_eq!(deleted, 2);

        assert!(matches!(cache.get("tournaments:aaa"), Lookup::Miss));
        assert!(matches!(cache.get("rankings:ccc"), Lookup::Hit { .. }));
    }

    #[test]
    fn invalidate_everything() {
        let cache = TieredCache::new(&settings());
        cache.put("a", b"1", "application/json", None);
        cache.put("b", b"2", "application/json", None);

        let deleted = cache.invalidate(".*").unwrap();
        assert_eq!(deleted, 2);
        assert!(matches!(cache.get("a"), Lookup::Miss));
        assert!(matches!(cache.get("b"), Lookup::Miss));
    }

    #[test]
    fn invalidate_rejects_bad_patterns() {
        let cache = TieredCache::new(&settings());
        assert!(matches!(
            cache.invalidate("([unclosed"),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn disabled_tiers_are_skipped() {
        let mut s = settings();
        s.l2.enabled = false;
        let cache = TieredCache::new(&s);

        cache.put("k", b"v", "application/json", None);
        assert!(cache.tier("L2").is_none());
        assert_eq!(cache.tier("L1").unwrap().len(), 1);
        assert_eq!(cache.tier("L3").unwrap().len(), 1);
    }

    #[test]
    fn explicit_ttl_applies_to_all_tiers() {
        let cache = TieredCache::new(&settings());
        cache.put("k", b"v", "application/json", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));

        for name in ["L1", "L2", "L3"] {
            assert!(
                !matches!(cache.tier(name).unwrap().get("k"), TierLookup::Hit(_)),
                "{name} should have expired"
            );
        }
    }
}
