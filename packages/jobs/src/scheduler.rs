//! Periodic job runner.
//!
//! Each job gets its own task ticking on a fixed interval. Tasks stop when
//! the shutdown channel flips to `true` or its sender is dropped. A job
//! with an interval of `0` is not scheduled.

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    AnonymizeLocationData, CacheSweep, ExpireOccurrences, RecalculateRiskIndex,
    progress::null_progress, recalculate::DEFAULT_BATCH_SIZE,
};

/// Job intervals in seconds. `0` disables a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Drop expired cache entries.
    pub cache_sweep_secs: u64,
    /// Also drop cache entries close to expiry.
    pub forced_sweep_secs: u64,
    /// Recompute every region's risk.
    pub recalculate_secs: u64,
    /// Anonymize old location data.
    pub anonymize_secs: u64,
    /// Expire old collaborative reports.
    pub expire_secs: u64,
    /// Regions per page for the full recalculation.
    pub batch_size: usize,
    /// Concurrent partitions for the full recalculation.
    pub workers: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cache_sweep_secs: 60 * 60,
            forced_sweep_secs: 24 * 60 * 60,
            recalculate_secs: 24 * 60 * 60,
            anonymize_secs: 24 * 60 * 60,
            expire_secs: 24 * 60 * 60,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 4,
        }
    }
}

/// Runs the maintenance jobs on their configured intervals.
pub struct Scheduler {
    config: ScheduleConfig,
    recalculate: RecalculateRiskIndex,
    anonymize: Arc<AnonymizeLocationData>,
    expire: Arc<ExpireOccurrences>,
    sweep: CacheSweep,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: ScheduleConfig,
        recalculate: RecalculateRiskIndex,
        anonymize: AnonymizeLocationData,
        expire: ExpireOccurrences,
        sweep: CacheSweep,
    ) -> Self {
        Self {
            config,
            recalculate,
            anonymize: Arc::new(anonymize),
            expire: Arc::new(expire),
            sweep,
        }
    }

    /// Spawns one task per enabled job and returns their handles.
    ///
    /// The first run of each job happens one interval after spawning.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Self {
            config,
            recalculate,
            anonymize,
            expire,
            sweep,
        } = self;
        let mut handles = Vec::new();

        if config.cache_sweep_secs > 0 {
            let sweep = sweep.clone();
            handles.push(every(
                "cache-sweep",
                config.cache_sweep_secs,
                shutdown.clone(),
                move || {
                    let sweep = sweep.clone();
                    async move {
                        sweep.run(false);
                    }
                },
            ));
        }

        if config.forced_sweep_secs > 0 {
            handles.push(every(
                "forced-cache-sweep",
                config.forced_sweep_secs,
                shutdown.clone(),
                move || {
                    let sweep = sweep.clone();
                    async move {
                        sweep.run(true);
                    }
                },
            ));
        }

        if config.recalculate_secs > 0 {
            handles.push(every(
                "recalculate",
                config.recalculate_secs,
                shutdown.clone(),
                move || {
                    let job = recalculate.clone();
                    async move {
                        if let Err(e) = job
                            .run_all(config.batch_size, config.workers, &null_progress())
                            .await
                        {
                            log::error!("Scheduled recalculation failed: {e}");
                        }
                    }
                },
            ));
        }

        if config.anonymize_secs > 0 {
            handles.push(every(
                "anonymize",
                config.anonymize_secs,
                shutdown.clone(),
                move || {
                    let job = anonymize.clone();
                    async move {
                        if let Err(e) = job.run().await {
                            log::error!("Scheduled anonymization failed: {e}");
                        }
                    }
                },
            ));
        }

        if config.expire_secs > 0 {
            handles.push(every(
                "expire",
                config.expire_secs,
                shutdown,
                move || {
                    let job = expire.clone();
                    async move {
                        if let Err(e) = job.run().await {
                            log::error!("Scheduled expiry failed: {e}");
                        }
                    }
                },
            ));
        }

        log::info!("Scheduler started {} job(s)", handles.len());
        handles
    }
}

fn every<F, Fut>(
    name: &'static str,
    period_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = Duration::from_secs(period_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::debug!("{name}: every {period_secs}s");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    log::debug!("{name}: running");
                    task().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        log::info!("{name}: stopped");
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use safewalk_risk::{RiskConfig, RiskService};
    use safewalk_routing::TrafficCacheManager;
    use safewalk_store::MemoryStore;

    use super::*;
    use crate::AnonymizeConfig;

    fn scheduler(config: ScheduleConfig, cache: Arc<TrafficCacheManager>) -> Scheduler {
        let store = Arc::new(MemoryStore::new());
        let risk = Arc::new(RiskService::new(
            store.clone(),
            store.clone(),
            RiskConfig::default(),
        ));
        Scheduler::new(
            config,
            RecalculateRiskIndex::new(risk.clone()),
            AnonymizeLocationData::new(store.clone(), AnonymizeConfig::default()),
            ExpireOccurrences::new(store, risk),
            CacheSweep::new(cache),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_and_stops_on_shutdown() {
        let cache = Arc::new(TrafficCacheManager::default());
        cache.put("stale", &1, ChronoDuration::seconds(-1));

        let config = ScheduleConfig {
            cache_sweep_secs: 5,
            ..ScheduleConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let handles = scheduler(config, cache.clone()).spawn(rx);
        assert_eq!(handles.len(), 5);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.cache_stats().total_keys, 0);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn zero_interval_disables_a_job() {
        let config = ScheduleConfig {
            cache_sweep_secs: 0,
            forced_sweep_secs: 0,
            recalculate_secs: 0,
            anonymize_secs: 0,
            expire_secs: 3600,
            ..ScheduleConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let handles = scheduler(config, Arc::new(TrafficCacheManager::default())).spawn(rx);
        assert_eq!(handles.len(), 1);

        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
