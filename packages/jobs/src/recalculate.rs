//! Region risk recalculation.

use std::{sync::Arc, time::Instant};

use safewalk_risk::{BatchSummary, RiskService};
use safewalk_risk_models::RiskSnapshot;

use crate::{JobError, progress::ProgressCallback};

/// Default regions per page.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Recomputes one region on demand, or every region in batches.
#[derive(Debug, Clone)]
pub struct RecalculateRiskIndex {
    risk: Arc<RiskService>,
}

impl RecalculateRiskIndex {
    #[must_use]
    pub const fn new(risk: Arc<RiskService>) -> Self {
        Self { risk }
    }

    /// Recomputes a single region, e.g. right after a new report.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Risk`] if the region is unknown or the store
    /// fails.
    pub async fn run_region(&self, region_id: i64) -> Result<RiskSnapshot, JobError> {
        let start = Instant::now();
        let snapshot = self.risk.recalculate_region_risk(region_id).await?;
        log::info!(
            "Recalculated region {region_id}: risk_index={:.2}, occurrence_count={} in {:.1}ms",
            snapshot.value,
            snapshot.occurrence_count,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(snapshot)
    }

    /// Recomputes every region. With more than one worker the id range is
    /// split and processed concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if paging fails. Individual region failures are
    /// counted in the summary.
    pub async fn run_all(
        &self,
        batch_size: usize,
        workers: usize,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<BatchSummary, JobError> {
        let start = Instant::now();
        progress.set_message("Recalculating region risk".to_string());

        let on_batch = |n: usize| progress.inc(n as u64);
        let summary = if workers > 1 {
            self.risk
                .recalculate_partitioned(workers, batch_size, &on_batch)
                .await?
        } else {
            self.risk
                .recalculate_range(None, None, batch_size, chrono::Utc::now(), &on_batch)
                .await?
        };

        let msg = format!(
            "{} regions recalculated, {} high risk, {} failed",
            summary.processed, summary.high_risk, summary.failed
        );
        log::info!("{msg} in {:.1}s", start.elapsed().as_secs_f64());
        progress.finish(msg);

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use safewalk_risk::RiskConfig;
    use safewalk_risk_models::{
        Coordinates, NewOccurrence, OccurrenceSource, OccurrenceStatus, Region, Severity,
    };
    use safewalk_store::{MemoryStore, OccurrenceRepository, RegionRepository};

    use super::*;
    use crate::progress::null_progress;

    fn square(id: i64) -> Region {
        #[allow(clippy::cast_precision_loss)]
        let lng = id as f64;
        Region::new(
            id,
            format!("Cell {id}"),
            vec![
                Coordinates { lat: 0.0, lng },
                Coordinates { lat: 0.0, lng: lng + 1.0 },
                Coordinates { lat: 1.0, lng: lng + 1.0 },
                Coordinates { lat: 1.0, lng },
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn recalculates_every_region() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_regions((1..=9).map(square).collect())
            .await
            .unwrap();
        store
            .insert_occurrences(vec![NewOccurrence {
                location: Coordinates { lat: 0.5, lng: 3.5 },
                crime_type_id: 1,
                severity: Severity::High,
                confidence_score: 80,
                source: OccurrenceSource::Official,
                created_by: None,
                region_id: Some(3),
                timestamp: Utc::now(),
                status: OccurrenceStatus::Verified,
            }])
            .await
            .unwrap();

        let job = RecalculateRiskIndex::new(Arc::new(RiskService::new(
            store.clone(),
            store.clone(),
            RiskConfig::default(),
        )));

        let summary = job.run_all(4, 3, &null_progress()).await.unwrap();
        assert_eq!(summary.processed, 9);

        let snapshot = job.run_region(3).await.unwrap();
        assert_eq!(snapshot.occurrence_count, 1);
        assert!(snapshot.value > 0.0);
    }
}
