//! Location data anonymization.
//!
//! Strips user identity from navigation sessions and occurrence reports
//! older than a threshold, then keeps only route usage aggregates for
//! origin/destination groups large enough to hide any single user. The
//! whole run is one transaction: any failure leaves the data untouched.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use safewalk_risk::window_start;
use safewalk_risk_models::{NavigationSession, RouteUsageAggregate};
use safewalk_store::{LocationDataStore, LocationTransaction, StoreError};
use serde::{Deserialize, Serialize};

use crate::JobError;

/// Retention and cohort limits for [`AnonymizeLocationData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizeConfig {
    /// Data older than this many days is anonymized.
    pub threshold_days: i64,
    /// Smallest origin/destination group that may be kept as an aggregate.
    pub min_cohort_size: u32,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        Self {
            threshold_days: 7,
            min_cohort_size: 5,
        }
    }
}

/// What one anonymization run changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnonymizeReport {
    /// Sessions whose user id was cleared.
    pub sessions_anonymized: usize,
    /// Occurrences whose reporter was cleared.
    pub occurrences_anonymized: usize,
    /// Route usage aggregates written, one per kept group.
    pub aggregates_created: usize,
    /// Groups dropped for being smaller than the minimum cohort.
    pub groups_suppressed: usize,
}

/// Periodic job that strips user identity from old location data.
pub struct AnonymizeLocationData {
    store: Arc<dyn LocationDataStore>,
    config: AnonymizeConfig,
}

impl std::fmt::Debug for AnonymizeLocationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnonymizeLocationData")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AnonymizeLocationData {
    /// Every run opens one transaction on `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LocationDataStore>, config: AnonymizeConfig) -> Self {
        Self { store, config }
    }

    /// Anonymizes everything older than the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Store`] if any step fails. The transaction is
    /// rolled back and nothing is changed. Returns [`JobError::Risk`]
    /// before touching the store if `threshold_days` is out of range.
    pub async fn run(&self) -> Result<AnonymizeReport, JobError> {
        self.run_at(Utc::now()).await
    }

    /// [`Self::run`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<AnonymizeReport, JobError> {
        let cutoff = window_start(now, self.config.threshold_days)?;
        let mut tx = self.store.begin().await?;

        match anonymize(tx.as_mut(), cutoff, self.config.min_cohort_size).await {
            Ok(report) => {
                tx.commit().await?;
                log::info!(
                    "Anonymized data before {}: {} sessions, {} occurrences, {} aggregates ({} groups suppressed)",
                    cutoff.format("%Y-%m-%d %H:%M"),
                    report.sessions_anonymized,
                    report.occurrences_anonymized,
                    report.aggregates_created,
                    report.groups_suppressed
                );
                Ok(report)
            }
            Err(e) => {
                log::error!("Anonymization failed, rolling back: {e}");
                if let Err(rollback) = tx.rollback().await {
                    log::error!("Rollback failed: {rollback}");
                }
                Err(e.into())
            }
        }
    }
}

async fn anonymize(
    tx: &mut dyn LocationTransaction,
    cutoff: DateTime<Utc>,
    min_cohort_size: u32,
) -> Result<AnonymizeReport, StoreError> {
    let sessions = tx.anonymize_sessions_before(cutoff).await?;
    let occurrences_anonymized = tx.anonymize_occurrences_before(cutoff).await?;

    let (aggregates, groups_suppressed) = cohort_aggregates(&sessions, min_cohort_size);
    let aggregates_created = aggregates.len();
    if !aggregates.is_empty() {
        tx.insert_route_aggregates(aggregates).await?;
    }

    Ok(AnonymizeReport {
        sessions_anonymized: sessions.len(),
        occurrences_anonymized,
        aggregates_created,
        groups_suppressed,
    })
}

/// Groups sessions by origin and destination region. Returns the groups
/// meeting `min_cohort_size` and the number of groups dropped.
fn cohort_aggregates(
    sessions: &[NavigationSession],
    min_cohort_size: u32,
) -> (Vec<RouteUsageAggregate>, usize) {
    let mut groups: BTreeMap<(i64, i64), Vec<&NavigationSession>> = BTreeMap::new();
    for session in sessions {
        if let (Some(origin), Some(destination)) =
            (session.origin_region_id, session.destination_region_id)
        {
            groups.entry((origin, destination)).or_default().push(session);
        }
    }

    let mut suppressed = 0;
    let mut aggregates = Vec::new();

    for ((origin_region_id, destination_region_id), members) in groups {
        let session_count = u32::try_from(members.len()).unwrap_or(u32::MAX);
        if session_count < min_cohort_size.max(1) {
            suppressed += 1;
            continue;
        }
        let starts = members.iter().map(|s| s.started_at);
        let (Some(period_start), Some(period_end)) = (starts.clone().min(), starts.max()) else {
            continue;
        };
        aggregates.push(RouteUsageAggregate {
            origin_region_id,
            destination_region_id,
            session_count,
            period_start,
            period_end,
        });
    }

    (aggregates, suppressed)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;
    use safewalk_risk_models::Coordinates;
    use safewalk_store::{MemoryStore, memory::MemoryTransaction};

    use super::*;

    fn session(
        user_id: i64,
        origin_region_id: i64,
        destination_region_id: i64,
        started_at: DateTime<Utc>,
    ) -> NavigationSession {
        NavigationSession {
            id: 0,
            user_id: Some(user_id),
            origin: Coordinates { lat: 1.0, lng: 1.0 },
            destination: Coordinates { lat: 2.0, lng: 2.0 },
            origin_region_id: Some(origin_region_id),
            destination_region_id: Some(destination_region_id),
            started_at,
            ended_at: Some(started_at + Duration::minutes(20)),
        }
    }

    async fn seeded(now: DateTime<Utc>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for user in 0..6 {
            store
                .insert_session(session(user, 1, 2, now - Duration::days(10 + user)))
                .await;
        }
        for user in 10..12 {
            store
                .insert_session(session(user, 1, 3, now - Duration::days(9)))
                .await;
        }
        store
            .insert_session(session(99, 1, 2, now - Duration::days(2)))
            .await;
        store
    }

    #[tokio::test]
    async fn strips_identity_and_keeps_large_cohorts() {
        let now = Utc::now();
        let store = seeded(now).await;
        let job = AnonymizeLocationData::new(store.clone(), AnonymizeConfig::default());

        let report = job.run_at(now).await.unwrap();

        assert_eq!(report.sessions_anonymized, 8);
        assert_eq!(report.aggregates_created, 1);
        assert_eq!(report.groups_suppressed, 1);

        let sessions = store.sessions().await;
        let old: Vec<_> = sessions
            .iter()
            .filter(|s| s.started_at < now - Duration::days(7))
            .collect();
        assert_eq!(old.len(), 8);
        assert!(old.iter().all(|s| s.user_id.is_none()));
        assert!(sessions.iter().any(|s| s.user_id == Some(99)));

        let aggregates = store.route_aggregates().await;
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].session_count, 6);
        assert_eq!(
            (aggregates[0].origin_region_id, aggregates[0].destination_region_id),
            (1, 2)
        );
    }

    /// Store whose transactions fail after anonymizing, before the
    /// aggregates are written.
    struct FailingStore {
        inner: Arc<MemoryStore>,
    }

    struct FailingTransaction<'a> {
        inner: MemoryTransaction<'a>,
    }

    #[async_trait]
    impl LocationDataStore for FailingStore {
        async fn begin<'a>(&'a self) -> Result<Box<dyn LocationTransaction + 'a>, StoreError> {
            Ok(Box::new(FailingTransaction {
                inner: self.inner.begin_memory().await,
            }))
        }
    }

    #[async_trait]
    impl LocationTransaction for FailingTransaction<'_> {
        async fn anonymize_sessions_before(
            &mut self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<NavigationSession>, StoreError> {
            self.inner.anonymize_sessions_before(cutoff).await
        }

        async fn anonymize_occurrences_before(
            &mut self,
            cutoff: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.inner.anonymize_occurrences_before(cutoff).await
        }

        async fn insert_route_aggregates(
            &mut self,
            _aggregates: Vec<RouteUsageAggregate>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Transaction {
                message: "connection lost".to_string(),
            })
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            Box::new(self.inner).commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            Box::new(self.inner).rollback().await
        }
    }

    #[tokio::test]
    async fn failure_mid_run_changes_nothing() {
        let now = Utc::now();
        let store = seeded(now).await;
        let job = AnonymizeLocationData::new(
            Arc::new(FailingStore {
                inner: store.clone(),
            }),
            AnonymizeConfig::default(),
        );

        let err = job.run_at(now).await.unwrap_err();
        assert!(matches!(err, JobError::Store(StoreError::Transaction { .. })));

        let sessions = store.sessions().await;
        assert_eq!(sessions.len(), 9);
        assert!(sessions.iter().all(|s| s.user_id.is_some()));
        assert!(store.route_aggregates().await.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_threshold_touches_nothing() {
        let now = Utc::now();
        let store = seeded(now).await;
        let job = AnonymizeLocationData::new(
            store.clone(),
            AnonymizeConfig {
                threshold_days: i64::MAX,
                ..AnonymizeConfig::default()
            },
        );

        let err = job.run_at(now).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Risk(safewalk_risk::RiskError::InvalidWindow(_))
        ));
        assert!(store.sessions().await.iter().all(|s| s.user_id.is_some()));
    }

    #[test]
    fn small_groups_are_suppressed() {
        let now = Utc::now();
        let sessions: Vec<NavigationSession> =
            (0..4).map(|u| session(u, 5, 6, now)).collect();
        let (aggregates, suppressed) = cohort_aggregates(&sessions, 5);
        assert!(aggregates.is_empty());
        assert_eq!(suppressed, 1);

        let (aggregates, _) = cohort_aggregates(&sessions, 4);
        assert_eq!(aggregates[0].session_count, 4);
    }
}
