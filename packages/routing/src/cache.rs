//! TTL cache for provider responses.
//!
//! Entries are keyed by a SHA-256 fingerprint of the request (kind,
//! provider, rounded endpoints and options) and hold the serialized
//! response. The cache is an optimization only: every storage or
//! serialization failure is logged and treated as a miss.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Duration, Utc};
use safewalk_risk_models::Coordinates;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest as _, Sha256};
use strum_macros::{AsRefStr, Display};

/// What kind of response an entry holds. Part of the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CacheKind {
    /// A single route.
    Route,
    /// A list of alternative routes.
    Alternatives,
    /// Forward geocoding results.
    Geocode,
    /// A reverse-geocoded address.
    ReverseGeocode,
    /// Traffic conditions along a route.
    Traffic,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Request fingerprint.
    pub key: String,
    /// Serialized response.
    pub payload: String,
    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn approximate_size(&self) -> usize {
        self.key.len() + self.payload.len() + std::mem::size_of::<DateTime<Utc>>()
    }
}

/// Failure of the backing store.
#[derive(Debug, thiserror::Error)]
#[error("cache store error: {message}")]
pub struct CacheStoreError {
    /// Description of what went wrong.
    pub message: String,
}

/// Storage behind the [`TrafficCacheManager`].
pub trait CacheStore: Send + Sync {
    /// Looks up an entry regardless of expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError>;

    /// Inserts or replaces an entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the store cannot be written.
    fn put(&self, entry: CacheEntry) -> Result<(), CacheStoreError>;

    /// Atomically removes every entry for which `evict` returns `true`.
    /// Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the store cannot be written.
    fn evict(&self, evict: &dyn Fn(&CacheEntry) -> bool) -> Result<usize, CacheStoreError>;

    /// Visits every entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the store cannot be read.
    fn scan(&self, visit: &mut dyn FnMut(&CacheEntry)) -> Result<(), CacheStoreError>;

    /// Removes everything.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the store cannot be written.
    fn clear(&self) -> Result<(), CacheStoreError>;
}

/// In-process [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<BTreeMap<String, CacheEntry>>,
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn evict(&self, evict: &dyn Fn(&CacheEntry) -> bool) -> Result<usize, CacheStoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !evict(entry));
        Ok(before - entries.len())
    }

    fn scan(&self, visit: &mut dyn FnMut(&CacheEntry)) -> Result<(), CacheStoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().for_each(visit);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheStoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// TTLs per response kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Route and alternative-route responses.
    pub route_ttl_secs: u64,
    /// Forward and reverse geocoding responses.
    pub geocode_ttl_secs: u64,
    /// Traffic responses.
    pub traffic_ttl_secs: u64,
    /// Forced cleanup also evicts entries with less than this many seconds
    /// left.
    pub force_min_remaining_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            route_ttl_secs: 15 * 60,
            geocode_ttl_secs: 24 * 60 * 60,
            traffic_ttl_secs: 5 * 60,
            force_min_remaining_secs: 5 * 60,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries stored.
    pub total_keys: usize,
    /// Entries not yet expired.
    pub valid_keys: usize,
    /// Entries past their expiry awaiting cleanup.
    pub expired_keys: usize,
    /// Approximate bytes held by keys and payloads.
    pub memory_usage: usize,
    /// Lookups served from the cache since startup.
    pub hits: u64,
    /// Lookups that missed since startup.
    pub misses: u64,
}

impl CacheStats {
    /// Share of stored entries that are still valid, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.total_keys == 0 {
            return 0.0;
        }
        self.valid_keys as f64 / self.total_keys as f64 * 100.0
    }
}

#[derive(Serialize)]
struct Fingerprint<'a, O: Serialize> {
    kind: CacheKind,
    provider: &'a str,
    origin: Option<Coordinates>,
    destination: Option<Coordinates>,
    options: &'a O,
}

/// Provider response cache with per-kind TTLs.
pub struct TrafficCacheManager {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for TrafficCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficCacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for TrafficCacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl TrafficCacheManager {
    /// Cache backed by a [`MemoryCacheStore`].
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::with_store(Arc::new(MemoryCacheStore::default()), config)
    }

    /// Cache backed by a custom store.
    #[must_use]
    pub fn with_store(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The active TTL configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Stable key for a request.
    ///
    /// Coordinates are rounded to six decimals so requests a few
    /// centimeters apart share an entry.
    #[must_use]
    pub fn fingerprint<O: Serialize>(
        kind: CacheKind,
        provider: &str,
        origin: Option<&Coordinates>,
        destination: Option<&Coordinates>,
        options: &O,
    ) -> String {
        let document = Fingerprint {
            kind,
            provider,
            origin: origin.map(Coordinates::rounded),
            destination: destination.map(Coordinates::rounded),
            options,
        };
        let canonical = serde_json::to_string(&document).unwrap_or_else(|e| {
            log::warn!("Failed to serialize cache fingerprint: {e}");
            format!("{kind}:{provider}")
        });
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// TTL for a response kind.
    #[must_use]
    pub fn ttl_for(&self, kind: CacheKind) -> Duration {
        let secs = match kind {
            CacheKind::Route | CacheKind::Alternatives => self.config.route_ttl_secs,
            CacheKind::Geocode | CacheKind::ReverseGeocode => self.config.geocode_ttl_secs,
            CacheKind::Traffic => self.config.traffic_ttl_secs,
        };
        seconds(secs)
    }

    /// Fetches a live entry.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    /// [`Self::get`] with an explicit clock.
    #[must_use]
    pub fn get_at<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let value = match self.store.get(key) {
            Ok(Some(entry)) if entry.expires_at > now => {
                match serde_json::from_str(&entry.payload) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        log::warn!("Discarding undecodable cache entry {key}: {e}");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("Cache lookup failed: {e}");
                None
            }
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Stores a response for `ttl`.
    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        self.put_at(key, value, ttl, Utc::now());
    }

    /// [`Self::put`] with an explicit clock.
    pub fn put_at<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Not caching {key}: {e}");
                return;
            }
        };
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        if let Err(e) = self.store.put(entry) {
            log::warn!("Cache write failed: {e}");
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats_at(Utc::now())
    }

    /// [`Self::cache_stats`] with an explicit clock.
    #[must_use]
    pub fn cache_stats_at(&self, now: DateTime<Utc>) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        let result = self.store.scan(&mut |entry| {
            stats.total_keys += 1;
            if entry.expires_at > now {
                stats.valid_keys += 1;
            } else {
                stats.expired_keys += 1;
            }
            stats.memory_usage += entry.approximate_size();
        });
        if let Err(e) = result {
            log::warn!("Cache scan failed: {e}");
        }
        stats
    }

    /// Removes expired entries and returns how many were removed.
    ///
    /// With `force`, entries with less than
    /// [`CacheConfig::force_min_remaining_secs`] left are removed too.
    pub fn cleanup_expired_cache(&self, force: bool) -> usize {
        self.cleanup_expired_cache_at(force, Utc::now())
    }

    /// [`Self::cleanup_expired_cache`] with an explicit clock.
    pub fn cleanup_expired_cache_at(&self, force: bool, now: DateTime<Utc>) -> usize {
        let threshold = if force {
            now.checked_add_signed(seconds(self.config.force_min_remaining_secs))
                .unwrap_or(now)
        } else {
            now
        };

        match self.store.evict(&|entry| entry.expires_at <= threshold) {
            Ok(removed) => {
                log::debug!("Cache cleanup (force={force}) removed {removed} entries");
                removed
            }
            Err(e) => {
                log::warn!("Cache cleanup failed: {e}");
                0
            }
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        if let Err(e) = self.store.clear() {
            log::warn!("Cache clear failed: {e}");
        }
    }
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}
