//! Expiry of stale collaborative reports.

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use chrono::{DateTime, Duration, Utc};
use safewalk_risk::RiskService;
use safewalk_risk_models::COLLABORATIVE_TTL_DAYS;
use safewalk_store::OccurrenceRepository;
use serde::Serialize;

use crate::JobError;

/// Outcome of an expiry run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    /// Reports moved to the expired status.
    pub expired: usize,
    /// Regions recomputed because an expired report counted towards them.
    pub regions_recalculated: usize,
}

/// Marks collaborative reports older than their lifetime as expired and
/// recomputes the regions they counted towards.
pub struct ExpireOccurrences {
    occurrences: Arc<dyn OccurrenceRepository>,
    risk: Arc<RiskService>,
}

impl std::fmt::Debug for ExpireOccurrences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpireOccurrences").finish_non_exhaustive()
    }
}

impl ExpireOccurrences {
    /// `risk` should read the same occurrence store.
    #[must_use]
    pub fn new(occurrences: Arc<dyn OccurrenceRepository>, risk: Arc<RiskService>) -> Self {
        Self { occurrences, risk }
    }

    /// # Errors
    ///
    /// Returns [`JobError::Store`] if the expiry update fails. A region that
    /// fails to recalculate is logged and skipped.
    pub async fn run(&self) -> Result<ExpiryReport, JobError> {
        self.run_at(Utc::now()).await
    }

    /// [`Self::run`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ExpiryReport, JobError> {
        let start = Instant::now();
        let cutoff = now - Duration::days(COLLABORATIVE_TTL_DAYS);

        let expired = self.occurrences.expire_collaborative(cutoff).await?;
        let touched: BTreeSet<i64> = expired.iter().filter_map(|o| o.region_id).collect();

        let mut regions_recalculated = 0;
        for region_id in touched {
            match self.risk.recalculate_region_risk_at(region_id, now).await {
                Ok(_) => regions_recalculated += 1,
                Err(e) => log::warn!("Failed to recalculate region {region_id}: {e}"),
            }
        }

        log::info!(
            "Expired {} collaborative occurrences, {regions_recalculated} regions recalculated in {:.1}ms",
            expired.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(ExpiryReport {
            expired: expired.len(),
            regions_recalculated,
        })
    }
}
