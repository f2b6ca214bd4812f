#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Region risk scoring.
//!
//! [`RiskService`] recomputes a region's risk index from the occurrences
//! inside its boundary over a trailing window. Every recomputation is a
//! pure function of the current occurrence set and replaces the previous
//! value, so running it twice without new data yields the same index.
//!
//! Recomputes for the same region never overlap: each region has its own
//! async lock, held for the read-compute-write sequence.

pub mod route_risk;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use safewalk_risk_models::{HIGH_RISK_THRESHOLD, Occurrence, Region, RiskSnapshot};
use safewalk_spatial::RegionShape;
use safewalk_store::{OccurrenceRepository, RegionRepository, StoreError};
use serde::{Deserialize, Serialize};

pub use route_risk::RouteRiskAnnotator;

/// Errors that can occur while scoring regions.
#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    /// The region does not exist.
    #[error("Region {0} not found")]
    RegionNotFound(i64),

    /// The region's boundary has no vertices.
    #[error("Region {0} has an empty boundary")]
    EmptyBoundary(i64),

    /// A configured day window does not fit the calendar.
    #[error("Window of {0} days is out of range")]
    InvalidWindow(i64),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Trailing window of occurrences considered, in days.
    pub window_days: i64,
    /// Weighted occurrence mass at which the index reaches ~63.
    pub saturation: f64,
    /// Index at or above which a region counts as high risk.
    pub high_risk_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            saturation: 50.0,
            high_risk_threshold: HIGH_RISK_THRESHOLD,
        }
    }
}

/// Outcome of a batch recomputation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Regions recomputed.
    pub processed: usize,
    /// Regions skipped because their recomputation failed.
    pub failed: usize,
    /// Recomputed regions at or above the high-risk threshold.
    pub high_risk: usize,
}

impl BatchSummary {
    const fn merge(self, other: Self) -> Self {
        Self {
            processed: self.processed + other.processed,
            failed: self.failed + other.failed,
            high_risk: self.high_risk + other.high_risk,
        }
    }
}

/// Maps contributing occurrences to a risk index in `[0, 100]`.
///
/// `raw = Σ severity weight × confidence factor`, then
/// `100 × (1 − e^(−raw / saturation))`, rounded to two decimals. No
/// occurrences score 0.
#[must_use]
pub fn risk_index<'a>(
    occurrences: impl IntoIterator<Item = &'a Occurrence>,
    saturation: f64,
) -> f64 {
    let saturation = if saturation.is_finite() && saturation > 0.0 {
        saturation
    } else {
        RiskConfig::default().saturation
    };

    let raw: f64 = occurrences
        .into_iter()
        .map(|o| o.severity.weight() * o.confidence_factor())
        .sum();

    if raw <= 0.0 {
        return 0.0;
    }

    let index = 100.0 * (1.0 - (-raw / saturation).exp());
    ((index * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// Computes and stores region risk indexes.
pub struct RiskService {
    regions: Arc<dyn RegionRepository>,
    occurrences: Arc<dyn OccurrenceRepository>,
    config: RiskConfig,
    in_flight: LockMap,
}

impl std::fmt::Debug for RiskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RiskService {
    /// Scores regions from `regions` using occurrences from
    /// `occurrences`. Both are usually the same store.
    #[must_use]
    pub fn new(
        regions: Arc<dyn RegionRepository>,
        occurrences: Arc<dyn OccurrenceRepository>,
        config: RiskConfig,
    ) -> Self {
        Self {
            regions,
            occurrences,
            config,
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    /// Active scoring parameters.
    #[must_use]
    pub const fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Occurrences that currently contribute to `region`'s index: inside
    /// its boundary, within the window, in a counting status, and not past
    /// the collaborative TTL.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError`] if the boundary is empty or the store fails.
    pub async fn contributing_occurrences(
        &self,
        region: &Region,
        now: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, RiskError> {
        let bbox = region
            .bounding_box()
            .ok_or(RiskError::EmptyBoundary(region.id))?;
        let since = window_start(now, self.config.window_days)?;

        let candidates = self.occurrences.occurrences_within(&bbox, since).await?;
        let shape = RegionShape::new(region);

        Ok(candidates
            .into_iter()
            .filter(|o| o.status.counts_toward_risk())
            .filter(|o| !o.is_expired_at(now))
            .filter(|o| shape.contains(&o.location))
            .collect())
    }

    /// Recomputes one region's index and stores it.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError::RegionNotFound`] for an unknown id, or a store
    /// error.
    pub async fn recalculate_region_risk(&self, region_id: i64) -> Result<RiskSnapshot, RiskError> {
        self.recalculate_region_risk_at(region_id, Utc::now()).await
    }

    /// [`Self::recalculate_region_risk`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Self::recalculate_region_risk`].
    pub async fn recalculate_region_risk_at(
        &self,
        region_id: i64,
        now: DateTime<Utc>,
    ) -> Result<RiskSnapshot, RiskError> {
        let entry = self.region_lock(region_id);
        let _guard = entry.lock.lock().await;

        let region = self
            .regions
            .region(region_id)
            .await?
            .ok_or(RiskError::RegionNotFound(region_id))?;

        let contributing = self.contributing_occurrences(&region, now).await?;
        let snapshot = RiskSnapshot {
            region_id,
            value: risk_index(&contributing, self.config.saturation),
            occurrence_count: u32::try_from(contributing.len()).unwrap_or(u32::MAX),
            computed_at: now,
        };

        self.regions.apply_risk_snapshot(&snapshot).await?;

        log::info!(
            "Region {} ({}): risk_index={:.2} (was {:.2}), occurrence_count={}",
            region_id,
            region.name,
            snapshot.value,
            region.risk_index,
            snapshot.occurrence_count
        );

        Ok(snapshot)
    }

    /// Recomputes every region, paging in id order.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError`] only if paging itself fails; individual region
    /// failures are logged and counted.
    pub async fn recalculate_all_regions(
        &self,
        batch_size: usize,
    ) -> Result<BatchSummary, RiskError> {
        self.recalculate_range(None, None, batch_size, Utc::now(), &|_| {})
            .await
    }

    /// Recomputes regions with `after_id < id <= max_id`, calling
    /// `on_batch` with the size of each finished page.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError`] only if paging itself fails.
    pub async fn recalculate_range(
        &self,
        after_id: Option<i64>,
        max_id: Option<i64>,
        batch_size: usize,
        now: DateTime<Utc>,
        on_batch: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<BatchSummary, RiskError> {
        let batch_size = batch_size.max(1);
        let mut after = after_id;
        let mut summary = BatchSummary::default();

        loop {
            let page = self.regions.regions_page(after, max_id, batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            for region in &page {
                match self.recalculate_region_risk_at(region.id, now).await {
                    Ok(snapshot) => {
                        summary.processed += 1;
                        if snapshot.value >= self.config.high_risk_threshold {
                            summary.high_risk += 1;
                        }
                    }
                    Err(e) => {
                        log::warn!("Skipping region {}: {e}", region.id);
                        summary.failed += 1;
                    }
                }
            }

            on_batch(page.len());

            if page.len() < batch_size {
                break;
            }
        }

        Ok(summary)
    }

    /// Splits the region id range into `workers` contiguous partitions and
    /// recomputes them concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first paging failure of any partition.
    pub async fn recalculate_partitioned(
        &self,
        workers: usize,
        batch_size: usize,
        on_batch: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<BatchSummary, RiskError> {
        let Some((min_id, max_id)) = self.regions.region_id_bounds().await? else {
            log::info!("No regions to recalculate");
            return Ok(BatchSummary::default());
        };

        let now = Utc::now();
        let partitions = partition_ids(min_id, max_id, workers);
        log::info!(
            "Recalculating regions {min_id}..={max_id} across {} partition(s)",
            partitions.len()
        );

        let results = futures::future::join_all(partitions.into_iter().map(|(after, max)| {
            self.recalculate_range(Some(after), Some(max), batch_size, now, on_batch)
        }))
        .await;

        results
            .into_iter()
            .try_fold(BatchSummary::default(), |acc, result| {
                result.map(|summary| acc.merge(summary))
            })
    }

    fn region_lock(&self, region_id: i64) -> RegionLock<'_> {
        let mut locks = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        RegionLock {
            in_flight: &self.in_flight,
            region_id,
            lock: Arc::clone(locks.entry(region_id).or_default()),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

type LockMap = Mutex<BTreeMap<i64, Arc<tokio::sync::Mutex<()>>>>;

/// A claim on one region's lock. The map entry is dropped with the last
/// claim.
struct RegionLock<'a> {
    in_flight: &'a LockMap,
    region_id: i64,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.region_id);
        }
    }
}

/// `now` minus `days` (negative counts as zero).
///
/// # Errors
///
/// Returns [`RiskError::InvalidWindow`] if the result is not a
/// representable time.
pub fn window_start(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, RiskError> {
    Duration::try_days(days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or(RiskError::InvalidWindow(days))
}

/// Splits `min..=max` into at most `workers` `(after_id, max_id]` ranges.
fn partition_ids(min_id: i64, max_id: i64, workers: usize) -> Vec<(i64, i64)> {
    let workers = i128::try_from(workers.max(1)).unwrap_or(1);
    let (min, max) = (i128::from(min_id), i128::from(max_id));
    let span = max - min + 1;
    let chunk = (span + workers - 1) / workers;

    let mut ranges = Vec::new();
    let mut lo = min;
    while lo <= max {
        let hi = (lo + chunk - 1).min(max);
        if let (Ok(after), Ok(hi)) = (i64::try_from(lo - 1), i64::try_from(hi)) {
            ranges.push((after, hi));
        } else {
            ranges.push((i64::MIN, max_id));
            break;
        }
        lo = hi + 1;
    }
    ranges
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};
    use safewalk_risk_models::{
        Coordinates, NewOccurrence, Occurrence, OccurrenceSource, OccurrenceStatus, Region,
        Severity,
    };

    /// Axis-aligned square region with its south-west corner at
    /// `(min_lat, min_lng)`.
    pub fn square(id: i64, min_lat: f64, min_lng: f64, size: f64) -> Region {
        Region::new(
            id,
            format!("Region {id}"),
            vec![
                Coordinates { lat: min_lat, lng: min_lng },
                Coordinates { lat: min_lat, lng: min_lng + size },
                Coordinates { lat: min_lat + size, lng: min_lng + size },
                Coordinates { lat: min_lat + size, lng: min_lng },
                Coordinates { lat: min_lat, lng: min_lng },
            ],
        )
        .unwrap()
    }

    pub fn stored(id: i64, new: NewOccurrence) -> Occurrence {
        Occurrence {
            id,
            location: new.location,
            crime_type_id: new.crime_type_id,
            severity: new.severity,
            confidence_score: new.confidence_score,
            source: new.source,
            created_by: new.created_by,
            region_id: new.region_id,
            timestamp: new.timestamp,
            status: new.status,
        }
    }

    pub fn occurrence(
        lat: f64,
        lng: f64,
        severity: Severity,
        confidence_score: i32,
        source: OccurrenceSource,
        timestamp: DateTime<Utc>,
    ) -> NewOccurrence {
        NewOccurrence {
            location: Coordinates { lat, lng },
            crime_type_id: 1,
            severity,
            confidence_score,
            source,
            created_by: Some(42),
            region_id: None,
            timestamp,
            status: OccurrenceStatus::Verified,
        }
    }
}
