//! Per-provider call budgets over rolling windows.
//!
//! The fallback adapter asks for a slot before every provider call. A
//! provider whose window is full is skipped instead of being called into a
//! certain rate-limit rejection. Providers without a configured limit are
//! unlimited.

use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Configured budget: `limit` calls per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Calls allowed per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

/// Usage of one provider's current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderQuota {
    /// Provider identifier.
    pub provider_name: String,
    /// When the current window opened.
    pub window_start: DateTime<Utc>,
    /// Calls made in the current window.
    pub call_count: u32,
    /// Calls allowed per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl ProviderQuota {
    /// When the current window closes.
    #[must_use]
    pub fn window_end(&self) -> DateTime<Utc> {
        i64::try_from(self.window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|window| self.window_start.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Calls still allowed in the current window.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.call_count)
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.window_end() {
            self.window_start = now;
            self.call_count = 0;
        }
    }
}

/// A provider's budget is spent until `resets_at`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("quota exceeded for {provider}: {limit} calls per window, resets at {resets_at}")]
pub struct QuotaExceeded {
    /// Provider identifier.
    pub provider: String,
    /// Calls allowed per window.
    pub limit: u32,
    /// When the window rolls over.
    pub resets_at: DateTime<Utc>,
}

/// Tracks call budgets for all providers.
#[derive(Debug, Default)]
pub struct QuotaManager {
    quotas: Mutex<BTreeMap<String, ProviderQuota>>,
}

impl QuotaManager {
    /// Creates a manager with no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or replaces a provider's limit and opens a fresh window.
    pub fn configure(&self, provider: &str, limit: QuotaLimit) {
        self.configure_at(provider, limit, Utc::now());
    }

    /// [`Self::configure`] with an explicit clock.
    pub fn configure_at(&self, provider: &str, limit: QuotaLimit, now: DateTime<Utc>) {
        self.lock().insert(
            provider.to_string(),
            ProviderQuota {
                provider_name: provider.to_string(),
                window_start: now,
                call_count: 0,
                limit: limit.limit,
                window_secs: limit.window_secs,
            },
        );
    }

    /// Claims one call slot.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaExceeded`] if the provider's window is full.
    pub fn try_acquire(&self, provider: &str) -> Result<(), QuotaExceeded> {
        self.try_acquire_at(provider, Utc::now())
    }

    /// [`Self::try_acquire`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaExceeded`] if the provider's window is full.
    pub fn try_acquire_at(&self, provider: &str, now: DateTime<Utc>) -> Result<(), QuotaExceeded> {
        let mut quotas = self.lock();
        let Some(quota) = quotas.get_mut(provider) else {
            return Ok(());
        };

        quota.roll(now);
        if quota.call_count >= quota.limit {
            return Err(QuotaExceeded {
                provider: provider.to_string(),
                limit: quota.limit,
                resets_at: quota.window_end(),
            });
        }
        quota.call_count += 1;
        Ok(())
    }

    /// Whether a call would currently be allowed, without claiming it.
    #[must_use]
    pub fn has_capacity_at(&self, provider: &str, now: DateTime<Utc>) -> bool {
        self.remaining_at(provider, now).is_none_or(|remaining| remaining > 0)
    }

    /// Calls left in the window, or `None` for unlimited providers.
    #[must_use]
    pub fn remaining_at(&self, provider: &str, now: DateTime<Utc>) -> Option<u32> {
        let mut quotas = self.lock();
        let quota = quotas.get_mut(provider)?;
        quota.roll(now);
        Some(quota.remaining())
    }

    /// Snapshot of every configured provider's window.
    #[must_use]
    pub fn usage(&self) -> Vec<ProviderQuota> {
        self.lock().values().cloned().collect()
    }

    /// Clears a provider's usage.
    pub fn reset(&self, provider: &str) {
        if let Some(quota) = self.lock().get_mut(provider) {
            quota.window_start = Utc::now();
            quota.call_count = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ProviderQuota>> {
        self.quotas.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn unlimited_provider_always_acquires() {
        let manager = QuotaManager::new();
        for _ in 0..100 {
            manager.try_acquire_at("osm", t0()).unwrap();
        }
        assert_eq!(manager.remaining_at("osm", t0()), None);
        assert!(manager.has_capacity_at("osm", t0()));
    }

    #[test]
    fn exhausts_and_rolls_over() {
        let manager = QuotaManager::new();
        manager.configure_at("google", QuotaLimit { limit: 2, window_secs: 60 }, t0());

        manager.try_acquire_at("google", t0()).unwrap();
        manager.try_acquire_at("google", t0() + Duration::seconds(10)).unwrap();
        let err = manager
            .try_acquire_at("google", t0() + Duration::seconds(20))
            .unwrap_err();
        assert_eq!(err.limit, 2);
        assert_eq!(err.resets_at, t0() + Duration::seconds(60));
        assert!(!manager.has_capacity_at("google", t0() + Duration::seconds(59)));

        let later = t0() + Duration::seconds(60);
        assert_eq!(manager.remaining_at("google", later), Some(2));
        manager.try_acquire_at("google", later).unwrap();
        assert_eq!(manager.usage()[0].call_count, 1);
    }

    #[test]
    fn zero_limit_blocks_everything() {
        let manager = QuotaManager::new();
        manager.configure_at("here", QuotaLimit { limit: 0, window_secs: 60 }, t0());
        assert!(manager.try_acquire_at("here", t0()).is_err());
    }
}
