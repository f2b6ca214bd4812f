#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Data access seams for the safewalk services.
//!
//! The services never talk to a database directly. They depend on the
//! repository traits in this crate, which a production deployment backs
//! with its own persistence layer. [`memory::MemoryStore`] implements all
//! of them in memory and can snapshot itself to a JSON file, which is what
//! the operator CLI and the tests use.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use safewalk_risk_models::{
    AlertPreference, BoundingBox, NavigationSession, NewOccurrence, Occurrence, Region,
    RiskSnapshot, RouteUsageAggregate,
};

pub use memory::MemoryStore;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced region does not exist.
    #[error("Region {0} not found")]
    RegionNotFound(i64),

    /// I/O error while reading or writing a snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A transaction could not be completed.
    #[error("Transaction error: {message}")]
    Transaction {
        /// Description of what went wrong.
        message: String,
    },

    /// Backend-specific failure.
    #[error("Storage error: {message}")]
    Backend {
        /// Description of what went wrong.
        message: String,
    },
}

/// Read and risk-update access to regions.
#[async_trait]
pub trait RegionRepository: Send + Sync {
    /// Fetches one region.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn region(&self, id: i64) -> Result<Option<Region>, StoreError>;

    /// Returns up to `limit` regions with `after_id < id <= max_id`, in id
    /// order. `None` bounds are open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn regions_page(
        &self,
        after_id: Option<i64>,
        max_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Region>, StoreError>;

    /// Smallest and largest region id, or `None` when there are no regions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn region_id_bounds(&self) -> Result<Option<(i64, i64)>, StoreError>;

    /// Returns every region in id order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn all_regions(&self) -> Result<Vec<Region>, StoreError>;

    /// Inserts seeded regions, replacing any with the same id. Returns the
    /// number stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn insert_regions(&self, regions: Vec<Region>) -> Result<usize, StoreError>;

    /// Overwrites a region's risk fields with a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RegionNotFound`] if the region is missing.
    async fn apply_risk_snapshot(&self, snapshot: &RiskSnapshot) -> Result<(), StoreError>;
}

/// Access to crime occurrences.
#[async_trait]
pub trait OccurrenceRepository: Send + Sync {
    /// Occurrences inside `bbox` with `timestamp >= since`, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn occurrences_within(
        &self,
        bbox: &BoundingBox,
        since: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError>;

    /// Stores a batch of new occurrences and returns them with ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn insert_occurrences(
        &self,
        batch: Vec<NewOccurrence>,
    ) -> Result<Vec<Occurrence>, StoreError>;

    /// Marks non-terminal collaborative occurrences with
    /// `timestamp <= cutoff` as expired and returns them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn expire_collaborative(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError>;
}

/// Access to per-user alert preferences.
#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    /// Fetches a user's preferences.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn preferences(&self, user_id: i64) -> Result<Option<AlertPreference>, StoreError>;

    /// Creates or replaces a user's preferences.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn save_preferences(&self, preferences: AlertPreference) -> Result<(), StoreError>;
}

/// Transactional access to user-linked location data.
#[async_trait]
pub trait LocationDataStore: Send + Sync {
    /// Starts a transaction. Nothing done through it is visible until
    /// [`LocationTransaction::commit`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction cannot be started.
    async fn begin<'a>(&'a self) -> Result<Box<dyn LocationTransaction + 'a>, StoreError>;
}

/// An open location-data transaction.
///
/// Dropping it without committing discards every change.
#[async_trait]
pub trait LocationTransaction: Send {
    /// Clears `user_id` on sessions started before `cutoff` that still
    /// carry one. Returns the affected sessions (already anonymized).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn anonymize_sessions_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<NavigationSession>, StoreError>;

    /// Clears `created_by` on occurrences reported before `cutoff`.
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn anonymize_occurrences_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Stores route usage aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn insert_route_aggregates(
        &mut self,
        aggregates: Vec<RouteUsageAggregate>,
    ) -> Result<(), StoreError>;

    /// Makes every change visible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing is applied then.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discards every change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails to roll back.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
