//! Provider response cache cleanup.

use std::sync::Arc;

use safewalk_routing::TrafficCacheManager;

#[derive(Debug, Clone)]
pub struct CacheSweep {
    cache: Arc<TrafficCacheManager>,
}

impl CacheSweep {
    #[must_use]
    pub const fn new(cache: Arc<TrafficCacheManager>) -> Self {
        Self { cache }
    }

    /// Evicts expired entries, or with `force` also those about to expire.
    /// Returns the number evicted.
    pub fn run(&self, force: bool) -> usize {
        let removed = self.cache.cleanup_expired_cache(force);
        let stats = self.cache.cache_stats();
        log::info!(
            "Cache sweep (force={force}): removed {removed}, {} entries left ({} valid, ~{} bytes)",
            stats.total_keys,
            stats.valid_keys,
            stats.memory_usage
        );
        removed
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use safewalk_routing::cache::CacheConfig;

    use super::*;

    #[test]
    fn forced_sweep_also_drops_nearly_expired_entries() {
        let cache = Arc::new(TrafficCacheManager::new(CacheConfig::default()));
        cache.put("expired", &1, Duration::seconds(-1));
        cache.put("soon", &2, Duration::seconds(60));
        cache.put("fresh", &3, Duration::hours(1));

        let sweep = CacheSweep::new(cache.clone());
        assert_eq!(sweep.run(false), 1);
        assert_eq!(sweep.run(true), 1);
        assert_eq!(cache.cache_stats().total_keys, 1);
        assert_eq!(cache.get::<i32>("fresh"), Some(3));
    }
}
