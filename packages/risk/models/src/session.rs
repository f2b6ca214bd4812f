//! Navigation history and the aggregates derived from it once anonymized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Coordinates;

/// One navigation from an origin to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationSession {
    /// Primary key.
    pub id: i64,
    /// Navigating user; cleared by anonymization.
    pub user_id: Option<i64>,
    /// Where the session started.
    pub origin: Coordinates,
    /// Where the session was heading.
    pub destination: Coordinates,
    /// Region containing `origin`, if any.
    pub origin_region_id: Option<i64>,
    /// Region containing `destination`, if any.
    pub destination_region_id: Option<i64>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, if the session finished.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Anonymous count of sessions between two regions.
///
/// Only produced for groups large enough that no single user can be
/// singled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUsageAggregate {
    /// Region the sessions started in.
    pub origin_region_id: i64,
    /// Region the sessions ended in.
    pub destination_region_id: i64,
    /// Number of sessions in the group.
    pub session_count: u32,
    /// Earliest session start in the group.
    pub period_start: DateTime<Utc>,
    /// Latest session start in the group.
    pub period_end: DateTime<Utc>,
}
