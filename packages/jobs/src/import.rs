//! Bulk occurrence import from CSV.
//!
//! Expected header:
//!
//! ```text
//! latitude,longitude,crime_type_id,severity,confidence_score,source,occurred_at[,created_by][,status]
//! ```
//!
//! `occurred_at` is RFC 3339. Rows that fail to parse or validate are
//! counted and skipped. Each row is attributed to the region containing
//! it, and every touched region is recalculated once at the end.

use std::{collections::BTreeSet, io::Read, path::Path, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use safewalk_risk::RiskService;
use safewalk_risk_models::{
    Coordinates, NewOccurrence, OccurrenceSource, OccurrenceStatus, Severity,
};
use safewalk_spatial::RegionLookup;
use safewalk_store::{OccurrenceRepository, StoreError};
use serde::{Deserialize, Serialize};

use crate::{JobError, progress::ProgressCallback};

/// Rows inserted per store call unless configured otherwise.
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 500;

/// Errors specific to reading import input.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct OccurrenceRecord {
    latitude: f64,
    longitude: f64,
    crime_type_id: i64,
    severity: String,
    confidence_score: i32,
    source: String,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    created_by: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

impl OccurrenceRecord {
    fn into_new_occurrence(self) -> Result<NewOccurrence, String> {
        let location = Coordinates::new(self.latitude, self.longitude).map_err(|e| e.to_string())?;
        let severity: Severity = self
            .severity
            .trim()
            .parse()
            .map_err(|_| format!("unknown severity {:?}", self.severity))?;
        let source: OccurrenceSource = self
            .source
            .trim()
            .parse()
            .map_err(|_| format!("unknown source {:?}", self.source))?;
        if !(0..=100).contains(&self.confidence_score) {
            return Err(format!(
                "confidence_score {} outside 0..=100",
                self.confidence_score
            ));
        }
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => match source {
                OccurrenceSource::Official => OccurrenceStatus::Verified,
                OccurrenceSource::Collaborative => OccurrenceStatus::Pending,
            },
            Some(s) => s.parse().map_err(|_| format!("unknown status {s:?}"))?,
        };

        Ok(NewOccurrence {
            location,
            crime_type_id: self.crime_type_id,
            severity,
            confidence_score: self.confidence_score,
            source,
            created_by: self.created_by,
            region_id: None,
            timestamp: self.occurred_at,
            status,
        })
    }
}

/// Counts from one CSV import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Data rows read, valid or not.
    pub rows: usize,
    /// Rows stored as occurrences.
    pub imported: usize,
    /// Rows rejected as malformed or out of range.
    pub skipped: usize,
    /// Imported rows that fell outside every region.
    pub unattributed: usize,
    /// Regions whose risk was recomputed after the import.
    pub regions_recalculated: usize,
}

/// Bulk CSV import of occurrence reports.
///
/// Rows are attributed to a region through the [`RegionLookup`], stored in
/// batches, and every touched region is recomputed once at the end.
pub struct ImportOccurrences {
    occurrences: Arc<dyn OccurrenceRepository>,
    lookup: Arc<dyn RegionLookup>,
    risk: Arc<RiskService>,
    batch_size: usize,
}

impl std::fmt::Debug for ImportOccurrences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportOccurrences")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl ImportOccurrences {
    /// Imports in batches of [`DEFAULT_IMPORT_BATCH_SIZE`].
    #[must_use]
    pub fn new(
        occurrences: Arc<dyn OccurrenceRepository>,
        lookup: Arc<dyn RegionLookup>,
        risk: Arc<RiskService>,
    ) -> Self {
        Self {
            occurrences,
            lookup,
            risk,
            batch_size: DEFAULT_IMPORT_BATCH_SIZE,
        }
    }

    /// Rows per insert. `0` is treated as `1`.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Imports the CSV file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Import`] if the file cannot be opened or the
    /// store rejects a batch.
    pub async fn run_path(
        &self,
        path: &Path,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<ImportReport, JobError> {
        let file = std::fs::File::open(path).map_err(ImportError::from)?;
        log::info!("Importing occurrences from {}", path.display());
        self.run(file, progress).await
    }

    /// Imports CSV rows from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Import`] if the header cannot be read or the
    /// store rejects a batch. Already inserted batches stay inserted.
    pub async fn run<R: Read + Send>(
        &self,
        reader: R,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<ImportReport, JobError> {
        let start = Instant::now();
        let mut report = ImportReport::default();

        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        csv_reader.headers().map_err(ImportError::from)?;

        let mut valid = Vec::new();
        for (line, result) in csv_reader.deserialize::<OccurrenceRecord>().enumerate() {
            report.rows += 1;
            let parsed = result
                .map_err(|e| e.to_string())
                .and_then(OccurrenceRecord::into_new_occurrence);
            match parsed {
                Ok(mut new) => {
                    new.region_id = self.lookup.region_at(&new.location);
                    if new.region_id.is_none() {
                        report.unattributed += 1;
                    }
                    valid.push(new);
                }
                Err(e) => {
                    log::debug!("Skipping row {}: {e}", line + 2);
                    report.skipped += 1;
                }
            }
        }

        progress.set_total(valid.len() as u64);
        progress.set_message("Importing occurrences".to_string());

        let mut touched = BTreeSet::new();
        let mut rows = valid.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<NewOccurrence> = rows.by_ref().take(self.batch_size).collect();
            let inserted = self
                .occurrences
                .insert_occurrences(batch)
                .await
                .map_err(ImportError::from)?;
            touched.extend(inserted.iter().filter_map(|o| o.region_id));
            report.imported += inserted.len();
            progress.inc(inserted.len() as u64);
        }

        for region_id in touched {
            match self.risk.recalculate_region_risk(region_id).await {
                Ok(_) => report.regions_recalculated += 1,
                Err(e) => log::warn!("Failed to recalculate region {region_id}: {e}"),
            }
        }

        let msg = format!(
            "{} of {} rows imported ({} skipped, {} outside any region), {} regions recalculated",
            report.imported,
            report.rows,
            report.skipped,
            report.unattributed,
            report.regions_recalculated
        );
        log::info!("{msg} in {:.1}s", start.elapsed().as_secs_f64());
        progress.finish(msg);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use safewalk_risk::RiskConfig;
    use safewalk_risk_models::Region;
    use safewalk_spatial::RegionIndex;
    use safewalk_store::{MemoryStore, RegionRepository};

    use super::*;
    use crate::progress::null_progress;

    const CSV: &str = "\
latitude,longitude,crime_type_id,severity,confidence_score,source,occurred_at,created_by
0.5,0.5,1,high,90,official,2026-10-01T10:00:00Z,
0.6,0.4,2,Critical,80,collaborative,2026-10-02T22:30:00Z,42
5.0,5.0,1,low,50,official,2026-10-03T08:00:00Z,
0.5,0.5,1,extreme,90,official,2026-10-01T10:00:00Z,
95.0,0.5,1,low,90,official,2026-10-01T10:00:00Z,
0.5,0.5,1,low,150,official,2026-10-01T10:00:00Z,
0.5,0.5,1,low,90,official,yesterday,
";

    async fn job(store: &Arc<MemoryStore>) -> ImportOccurrences {
        let region = Region::new(
            1,
            "Centro",
            vec![
                Coordinates { lat: 0.0, lng: 0.0 },
                Coordinates { lat: 0.0, lng: 1.0 },
                Coordinates { lat: 1.0, lng: 1.0 },
                Coordinates { lat: 1.0, lng: 0.0 },
            ],
        )
        .unwrap();
        let index = Arc::new(RegionIndex::build(std::slice::from_ref(&region)));
        store.insert_regions(vec![region]).await.unwrap();
        let risk = Arc::new(RiskService::new(
            store.clone(),
            store.clone(),
            RiskConfig::default(),
        ));
        ImportOccurrences::new(store.clone(), index, risk).with_batch_size(1)
    }

    #[tokio::test]
    async fn imports_valid_rows_and_skips_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let job = job(&store).await;

        let report = job.run(CSV.as_bytes(), &null_progress()).await.unwrap();

        assert_eq!(
            report,
            ImportReport {
                rows: 7,
                imported: 3,
                skipped: 4,
                unattributed: 1,
                regions_recalculated: 1,
            }
        );

        let occurrences = store.occurrences().await;
        assert_eq!(occurrences.len(), 3);
        let collaborative = occurrences
            .iter()
            .find(|o| o.source == OccurrenceSource::Collaborative)
            .unwrap();
        assert_eq!(collaborative.status, OccurrenceStatus::Pending);
        assert_eq!(collaborative.created_by, Some(42));
        assert_eq!(collaborative.region_id, Some(1));
    }

    #[tokio::test]
    async fn header_only_imports_nothing() {
        let store = Arc::new(MemoryStore::new());
        let job = job(&store).await;
        let header = CSV.lines().next().unwrap();

        let report = job.run(header.as_bytes(), &null_progress()).await.unwrap();
        assert_eq!(report, ImportReport::default());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let job = job(&store).await;

        let err = job
            .run_path(Path::new("/nonexistent/occurrences.csv"), &null_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Import(ImportError::Io(_))));
    }
}
