//! Progress reporting for long-running jobs.
//!
//! Jobs report through [`ProgressCallback`] without knowing how progress is
//! rendered. The CLI backs it with `indicatif` bars; the scheduler and the
//! tests use [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates from a running job.
///
/// Implementations must be `Send + Sync` so one instance can be shared by
/// concurrent partition workers.
pub trait ProgressCallback: Send + Sync {
    /// Number of items the job expects to process.
    fn set_total(&self, total: u64);

    /// `delta` more items are done.
    fn inc(&self, delta: u64);

    /// Current phase, e.g. "Reading CSV".
    fn set_message(&self, msg: String);

    /// The job is done; `msg` is its summary line.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
