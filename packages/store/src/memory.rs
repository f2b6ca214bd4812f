//! In-memory implementation of every repository trait.
//!
//! All state lives behind one async mutex. Transactions hold the lock for
//! their whole lifetime and work on a copy, so a rollback is simply
//! dropping the copy.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use safewalk_risk_models::{
    AlertPreference, BoundingBox, NavigationSession, NewOccurrence, Occurrence,
    OccurrenceStatus, Region, RiskSnapshot, RouteUsageAggregate,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    LocationDataStore, LocationTransaction, OccurrenceRepository, PreferenceRepository,
    RegionRepository, StoreError,
};

/// Everything the memory store holds. Also the JSON snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    /// Regions by id.
    #[serde(default)]
    pub regions: BTreeMap<i64, Region>,
    /// Occurrences by id.
    #[serde(default)]
    pub occurrences: BTreeMap<i64, Occurrence>,
    /// Alert preferences by user id.
    #[serde(default)]
    pub preferences: BTreeMap<i64, AlertPreference>,
    /// Navigation sessions by id.
    #[serde(default)]
    pub sessions: BTreeMap<i64, NavigationSession>,
    /// Anonymous route usage aggregates.
    #[serde(default)]
    pub route_aggregates: Vec<RouteUsageAggregate>,
}

impl StoreState {
    fn next_occurrence_id(&self) -> i64 {
        self.occurrences.keys().next_back().map_or(1, |id| id + 1)
    }

    fn next_session_id(&self) -> i64 {
        self.sessions.keys().next_back().map_or(1, |id| id + 1)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from existing state.
    #[must_use]
    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Loads a JSON snapshot, or returns an empty store if the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            log::info!("No data file at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let state: StoreState = serde_json::from_str(&contents)?;
        log::info!(
            "Loaded {} regions, {} occurrences, {} sessions from {}",
            state.regions.len(),
            state.occurrences.len(),
            state.sessions.len(),
            path.display()
        );
        Ok(Self::from_state(state))
    }

    /// Writes a JSON snapshot, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization or the write fails.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = {
            let state = self.state.lock().await;
            serde_json::to_string_pretty(&*state)?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Returns a copy of the current state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }

    /// Stores a navigation session, assigning an id when `session.id` is 0.
    pub async fn insert_session(&self, mut session: NavigationSession) -> NavigationSession {
        let mut state = self.state.lock().await;
        if session.id == 0 {
            session.id = state.next_session_id();
        }
        state.sessions.insert(session.id, session.clone());
        session
    }

    /// All sessions in id order.
    pub async fn sessions(&self) -> Vec<NavigationSession> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    /// All occurrences in id order.
    pub async fn occurrences(&self) -> Vec<Occurrence> {
        self.state.lock().await.occurrences.values().cloned().collect()
    }

    /// All stored route usage aggregates.
    pub async fn route_aggregates(&self) -> Vec<RouteUsageAggregate> {
        self.state.lock().await.route_aggregates.clone()
    }

    /// Opens a transaction with concrete type, for wrapping in tests and
    /// decorators. Blocks the whole store until it ends; see
    /// [`MemoryTransaction`].
    pub async fn begin_memory(&self) -> MemoryTransaction<'_> {
        let guard = self.state.lock().await;
        let working = guard.clone();
        MemoryTransaction { guard, working }
    }
}

#[async_trait]
impl RegionRepository for MemoryStore {
    async fn region(&self, id: i64) -> Result<Option<Region>, StoreError> {
        Ok(self.state.lock().await.regions.get(&id).cloned())
    }

    async fn regions_page(
        &self,
        after_id: Option<i64>,
        max_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Region>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .regions
            .values()
            .filter(|r| after_id.is_none_or(|after| r.id > after))
            .filter(|r| max_id.is_none_or(|max| r.id <= max))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn region_id_bounds(&self) -> Result<Option<(i64, i64)>, StoreError> {
        let state = self.state.lock().await;
        let first = state.regions.keys().next().copied();
        let last = state.regions.keys().next_back().copied();
        Ok(first.zip(last))
    }

    async fn all_regions(&self) -> Result<Vec<Region>, StoreError> {
        Ok(self.state.lock().await.regions.values().cloned().collect())
    }

    async fn insert_regions(&self, regions: Vec<Region>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let count = regions.len();
        for region in regions {
            state.regions.insert(region.id, region);
        }
        Ok(count)
    }

    async fn apply_risk_snapshot(&self, snapshot: &RiskSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let region = state
            .regions
            .get_mut(&snapshot.region_id)
            .ok_or(StoreError::RegionNotFound(snapshot.region_id))?;
        region.risk_index = snapshot.value;
        region.occurrence_count = snapshot.occurrence_count;
        region.last_recalculated_at = Some(snapshot.computed_at);
        Ok(())
    }
}

#[async_trait]
impl OccurrenceRepository for MemoryStore {
    async fn occurrences_within(
        &self,
        bbox: &BoundingBox,
        since: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .occurrences
            .values()
            .filter(|o| o.timestamp >= since && bbox.contains(&o.location))
            .cloned()
            .collect())
    }

    async fn insert_occurrences(
        &self,
        batch: Vec<NewOccurrence>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let mut state = self.state.lock().await;
        let mut next_id = state.next_occurrence_id();
        let mut inserted = Vec::with_capacity(batch.len());

        for new in batch {
            let occurrence = Occurrence {
                id: next_id,
                location: new.location,
                crime_type_id: new.crime_type_id,
                severity: new.severity,
                confidence_score: new.confidence_score,
                source: new.source,
                created_by: new.created_by,
                region_id: new.region_id,
                timestamp: new.timestamp,
                status: new.status,
            };
            state.occurrences.insert(next_id, occurrence.clone());
            inserted.push(occurrence);
            next_id += 1;
        }

        Ok(inserted)
    }

    async fn expire_collaborative(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();

        for occurrence in state.occurrences.values_mut() {
            if occurrence.source.is_time_limited()
                && occurrence.timestamp <= cutoff
                && !occurrence.status.is_terminal()
            {
                occurrence.status = OccurrenceStatus::Expired;
                expired.push(occurrence.clone());
            }
        }

        Ok(expired)
    }
}

#[async_trait]
impl PreferenceRepository for MemoryStore {
    async fn preferences(&self, user_id: i64) -> Result<Option<AlertPreference>, StoreError> {
        Ok(self.state.lock().await.preferences.get(&user_id).cloned())
    }

    async fn save_preferences(&self, preferences: AlertPreference) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .preferences
            .insert(preferences.user_id, preferences);
        Ok(())
    }
}

#[async_trait]
impl LocationDataStore for MemoryStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn LocationTransaction + 'a>, StoreError> {
        Ok(Box::new(self.begin_memory().await))
    }
}

/// A transaction over [`MemoryStore`].
///
/// Holds the store lock and a working copy; `commit` swaps the copy in.
/// Every other call on the store, reads included, waits until the
/// transaction is committed, rolled back or dropped. That keeps the swap
/// from overwriting concurrent writes, at the cost of stalling readers for
/// the length of the job.
pub struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, StoreState>,
    working: StoreState,
}

#[async_trait]
impl LocationTransaction for MemoryTransaction<'_> {
    async fn anonymize_sessions_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<NavigationSession>, StoreError> {
        let mut affected = Vec::new();
        for session in self.working.sessions.values_mut() {
            if session.started_at < cutoff && session.user_id.is_some() {
                session.user_id = None;
                affected.push(session.clone());
            }
        }
        Ok(affected)
    }

    async fn anonymize_occurrences_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut count = 0;
        for occurrence in self.working.occurrences.values_mut() {
            if occurrence.timestamp < cutoff && occurrence.created_by.is_some() {
                occurrence.created_by = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_route_aggregates(
        &mut self,
        aggregates: Vec<RouteUsageAggregate>,
    ) -> Result<(), StoreError> {
        self.working.route_aggregates.extend(aggregates);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use safewalk_risk_models::{Coordinates, OccurrenceSource, Severity};

    use super::*;

    fn square(id: i64) -> Region {
        #[allow(clippy::cast_precision_loss)]
        let base = id as f64;
        Region::new(
            id,
            format!("r{id}"),
            vec![
                Coordinates { lat: base, lng: 0.0 },
                Coordinates { lat: base, lng: 1.0 },
                Coordinates { lat: base + 1.0, lng: 1.0 },
                Coordinates { lat: base + 1.0, lng: 0.0 },
            ],
        )
        .unwrap()
    }

    fn new_occurrence(source: OccurrenceSource, timestamp: DateTime<Utc>) -> NewOccurrence {
        NewOccurrence {
            location: Coordinates { lat: 1.5, lng: 0.5 },
            crime_type_id: 1,
            severity: Severity::High,
            confidence_score: 90,
            source,
            created_by: Some(7),
            region_id: Some(1),
            timestamp,
            status: OccurrenceStatus::Pending,
        }
    }

    #[tokio::test]
    async fn pages_regions_in_id_order() {
        let store = MemoryStore::new();
        store
            .insert_regions((1..=5).rev().map(square).collect())
            .await
            .unwrap();

        let page = store.regions_page(None, None, 2).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        let page = store.regions_page(Some(2), Some(4), 10).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4]);

        assert_eq!(store.region_id_bounds().await.unwrap(), Some((1, 5)));
    }

    #[tokio::test]
    async fn snapshot_replaces_risk_fields() {
        let store = MemoryStore::new();
        store.insert_regions(vec![square(1)]).await.unwrap();
        let now = Utc::now();
        store
            .apply_risk_snapshot(&RiskSnapshot {
                region_id: 1,
                value: 42.0,
                occurrence_count: 3,
                computed_at: now,
            })
            .await
            .unwrap();

        let region = store.region(1).await.unwrap().unwrap();
        assert!((region.risk_index - 42.0).abs() < f64::EPSILON);
        assert_eq!(region.occurrence_count, 3);
        assert_eq!(region.last_recalculated_at, Some(now));

        let missing = store
            .apply_risk_snapshot(&RiskSnapshot {
                region_id: 99,
                value: 1.0,
                occurrence_count: 0,
                computed_at: now,
            })
            .await;
        assert!(matches!(missing, Err(StoreError::RegionNotFound(99))));
    }

    #[tokio::test]
    async fn expires_only_old_collaborative_reports() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_occurrences(vec![
                new_occurrence(OccurrenceSource::Collaborative, now - Duration::days(10)),
                new_occurrence(OccurrenceSource::Collaborative, now - Duration::days(1)),
                new_occurrence(OccurrenceSource::Official, now - Duration::days(10)),
            ])
            .await
            .unwrap();

        let expired = store
            .expire_collaborative(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 1);

        // Already expired rows are not reported twice.
        let again = store
            .expire_collaborative(now - Duration::days(7))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_changes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_occurrences(vec![new_occurrence(
                OccurrenceSource::Official,
                now - Duration::days(30),
            )])
            .await
            .unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            assert_eq!(tx.anonymize_occurrences_before(now).await.unwrap(), 1);
        }
        assert_eq!(store.occurrences().await[0].created_by, Some(7));

        let mut tx = store.begin().await.unwrap();
        tx.anonymize_occurrences_before(now).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.occurrences().await[0].created_by, None);
    }

    #[tokio::test]
    async fn readers_wait_for_an_open_transaction() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_occurrences(vec![new_occurrence(
                OccurrenceSource::Official,
                now - Duration::days(30),
            )])
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.anonymize_occurrences_before(now).await.unwrap();
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), store.occurrences()).await;
        assert!(blocked.is_err());

        tx.commit().await.unwrap();
        assert_eq!(store.occurrences().await[0].created_by, None);
    }

    #[tokio::test]
    async fn snapshot_file_round_trip() {
        let store = MemoryStore::new();
        store.insert_regions(vec![square(1), square(2)]).await.unwrap();

        let path = std::env::temp_dir().join(format!(
            "safewalk-store-{}-{}.json",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        store.save(&path).await.unwrap();
        let loaded = MemoryStore::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.all_regions().await.unwrap().len(), 2);
    }
}
