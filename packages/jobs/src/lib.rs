#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Batch jobs.
//!
//! Each job is a small struct holding the services it drives and exposing
//! a `run*` method that the CLI calls on demand and the [`scheduler`] calls
//! on a timer. Jobs log a summary line per run.

pub mod anonymize;
pub mod cache_sweep;
pub mod expire;
pub mod import;
pub mod progress;
pub mod recalculate;
pub mod scheduler;

use safewalk_risk::RiskError;
use safewalk_store::StoreError;

pub use anonymize::{AnonymizeConfig, AnonymizeLocationData, AnonymizeReport};
pub use cache_sweep::CacheSweep;
pub use expire::{ExpireOccurrences, ExpiryReport};
pub use import::{ImportError, ImportOccurrences, ImportReport};
pub use progress::{NullProgress, ProgressCallback, null_progress};
pub use recalculate::RecalculateRiskIndex;
pub use scheduler::{ScheduleConfig, Scheduler};

/// Errors that can occur while running a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Risk recomputation failure.
    #[error(transparent)]
    Risk(#[from] RiskError),

    /// Bulk import failure.
    #[error(transparent)]
    Import(#[from] ImportError),
}
