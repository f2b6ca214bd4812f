#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Core domain types shared across the safewalk workspace.
//!
//! Regions carry an aggregate risk index derived from the occurrences
//! reported inside them. Occurrences come either from official sources or
//! from users (collaborative), and collaborative reports are only
//! considered for a limited time. Severity and status values carry their
//! behavior as plain functions on the enums.

pub mod preference;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use preference::AlertPreference;
pub use session::{NavigationSession, RouteUsageAggregate};

/// Risk index at or above which a region is considered high-risk.
pub const HIGH_RISK_THRESHOLD: f64 = 70.0;

/// Number of days a collaborative occurrence stays relevant.
pub const COLLABORATIVE_TTL_DAYS: i64 = 7;

/// Errors raised when user-supplied input is malformed.
///
/// Validation failures are never retried and are surfaced to the caller
/// immediately.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Latitude outside `[-90, 90]` or not finite.
    #[error("invalid latitude {0}: expected a value in [-90, 90]")]
    Latitude(f64),

    /// Longitude outside `[-180, 180]` or not finite.
    #[error("invalid longitude {0}: expected a value in [-180, 180]")]
    Longitude(f64),

    /// Empty or whitespace-only address query.
    #[error("address must not be empty")]
    EmptyAddress,

    /// A time-of-day that is not in `HH:mm` form.
    #[error("invalid time of day {0:?}: expected HH:mm")]
    TimeOfDay(String),

    /// A weekday index outside `0..=6`.
    #[error("invalid weekday {0}: expected 0 (Sunday) through 6 (Saturday)")]
    Weekday(u8),

    /// A region boundary with too few vertices to form a ring.
    #[error("region boundary needs at least 3 distinct vertices, got {0}")]
    Boundary(usize),

    /// Free-form validation failure.
    #[error("{0}")]
    Other(String),
}

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl Coordinates {
    /// Creates validated coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if either component is out of range or
    /// not finite.
    pub fn new(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        let coords = Self { lat, lng };
        coords.validate()?;
        Ok(coords)
    }

    /// Checks that both components are within WGS84 bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if either component is out of range or
    /// not finite.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError::Latitude(self.lat));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(ValidationError::Longitude(self.lng));
        }
        Ok(())
    }

    /// Coordinates rounded to six decimals (~0.1 m), used for stable
    /// fingerprints.
    #[must_use]
    pub fn rounded(&self) -> Self {
        let round = |v: f64| (v * 1e6).round() / 1e6;
        Self {
            lat: round(self.lat),
            lng: round(self.lng),
        }
    }
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Southern edge.
    pub min_lat: f64,
    /// Western edge.
    pub min_lng: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Eastern edge.
    pub max_lng: f64,
}

impl BoundingBox {
    /// Smallest box containing every point, or `None` for an empty slice.
    #[must_use]
    pub fn enclosing(points: &[Coordinates]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self {
            min_lat: first.lat,
            min_lng: first.lng,
            max_lat: first.lat,
            max_lng: first.lng,
        };
        for p in &points[1..] {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.min_lng = bbox.min_lng.min(p.lng);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.max_lng = bbox.max_lng.max(p.lng);
        }
        Some(bbox)
    }

    /// Whether the point lies inside or on the edge of the box.
    #[must_use]
    pub fn contains(&self, point: &Coordinates) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }
}

/// Severity of a reported occurrence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Severity {
    /// Minor incidents (vandalism, petty theft).
    Low,
    /// Moderate incidents (burglary, harassment).
    Medium,
    /// Serious incidents (robbery, assault).
    High,
    /// Most severe incidents (armed violence, homicide).
    Critical,
}

impl Severity {
    /// Numeric weight used by the risk aggregation.
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 2.5,
            Self::High => 5.0,
            Self::Critical => 10.0,
        }
    }

    /// Whether an occurrence of this severity is worth a real-time alert.
    #[must_use]
    pub const fn is_alertable(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Low, Self::Medium, Self::High, Self::Critical]
    }
}

/// Where an occurrence report came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OccurrenceSource {
    /// Submitted by a user of the app.
    Collaborative,
    /// Imported from police or other official data.
    Official,
}

impl OccurrenceSource {
    /// Collaborative reports expire after [`COLLABORATIVE_TTL_DAYS`].
    #[must_use]
    pub const fn is_time_limited(self) -> bool {
        matches!(self, Self::Collaborative)
    }
}

/// Lifecycle state of an occurrence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OccurrenceStatus {
    /// Reported but not yet reviewed.
    Pending,
    /// Confirmed by a moderator or an official source.
    Verified,
    /// Dealt with; the incident still happened.
    Resolved,
    /// Found to be false or a duplicate.
    Rejected,
    /// Collaborative report past its lifetime.
    Expired,
}

impl OccurrenceStatus {
    /// Whether occurrences in this state contribute to a region's risk.
    #[must_use]
    pub const fn counts_toward_risk(self) -> bool {
        matches!(self, Self::Pending | Self::Verified | Self::Resolved)
    }

    /// Whether the occurrence has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected | Self::Expired)
    }
}

/// A reported crime occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Primary key.
    pub id: i64,
    /// Where it happened.
    pub location: Coordinates,
    /// Crime type identifier (taxonomy owned elsewhere).
    pub crime_type_id: i64,
    /// How serious it was.
    pub severity: Severity,
    /// Reporter confidence, nominally 0-100.
    pub confidence_score: i32,
    /// Collaborative or official.
    pub source: OccurrenceSource,
    /// Reporting user; cleared once anonymized.
    pub created_by: Option<i64>,
    /// Region the occurrence was attributed to at ingestion time.
    pub region_id: Option<i64>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Lifecycle state.
    pub status: OccurrenceStatus,
}

impl Occurrence {
    /// Confidence as a factor in `[0, 1]`.
    #[must_use]
    pub fn confidence_factor(&self) -> f64 {
        f64::from(self.confidence_score.clamp(0, 100)) / 100.0
    }

    /// Whether a collaborative occurrence has outlived its TTL at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.source.is_time_limited()
            && self.timestamp <= now - chrono::Duration::days(COLLABORATIVE_TTL_DAYS)
    }
}

/// An occurrence that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOccurrence {
    /// Where it happened.
    pub location: Coordinates,
    /// Crime type identifier.
    pub crime_type_id: i64,
    /// How serious it was.
    pub severity: Severity,
    /// Reporter confidence, nominally 0-100.
    pub confidence_score: i32,
    /// Collaborative or official.
    pub source: OccurrenceSource,
    /// Reporting user.
    pub created_by: Option<i64>,
    /// Region the occurrence falls in, if known.
    pub region_id: Option<i64>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Initial lifecycle state.
    pub status: OccurrenceStatus,
}

/// A fixed geographic polygon carrying an aggregate risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Closed polygon ring (first vertex may or may not be repeated).
    pub boundary: Vec<Coordinates>,
    /// Current risk index, 0-100.
    pub risk_index: f64,
    /// Occurrences that contributed to `risk_index`.
    pub occurrence_count: u32,
    /// When `risk_index` was last computed.
    pub last_recalculated_at: Option<DateTime<Utc>>,
}

impl Region {
    /// Creates a region with a zero risk index.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if any vertex is invalid or the ring has
    /// fewer than three distinct vertices.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        boundary: Vec<Coordinates>,
    ) -> Result<Self, ValidationError> {
        for vertex in &boundary {
            vertex.validate()?;
        }
        let distinct = if boundary.len() > 1 && boundary.first() == boundary.last() {
            boundary.len() - 1
        } else {
            boundary.len()
        };
        if distinct < 3 {
            return Err(ValidationError::Boundary(distinct));
        }
        Ok(Self {
            id,
            name: name.into(),
            boundary,
            risk_index: 0.0,
            occurrence_count: 0,
            last_recalculated_at: None,
        })
    }

    /// Bounding box of the boundary ring.
    #[must_use]
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::enclosing(&self.boundary)
    }

    /// Whether the current risk index meets the given threshold.
    #[must_use]
    pub fn is_high_risk(&self, threshold: f64) -> bool {
        self.risk_index >= threshold
    }

    /// Classification of the current risk index.
    #[must_use]
    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_index(self.risk_index)
    }
}

/// Result of one risk recomputation for a region.
///
/// Each snapshot replaces the previous one; nothing accumulates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    /// Region the value belongs to.
    pub region_id: i64,
    /// Risk index, 0-100.
    pub value: f64,
    /// Occurrences that contributed.
    pub occurrence_count: u32,
    /// When the value was computed.
    pub computed_at: DateTime<Utc>,
}

/// Coarse classification of a risk index.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    /// Below 30.
    Low,
    /// 30 to below 50.
    Moderate,
    /// 50 to below 70.
    Elevated,
    /// 70 to below 90.
    High,
    /// 90 and above.
    Critical,
}

impl RiskLevel {
    /// Classifies a risk index.
    #[must_use]
    pub fn from_index(index: f64) -> Self {
        if index >= 90.0 {
            Self::Critical
        } else if index >= HIGH_RISK_THRESHOLD {
            Self::High
        } else if index >= 50.0 {
            Self::Elevated
        } else if index >= 30.0 {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_reject_out_of_range() {
        assert!(Coordinates::new(45.0, 90.0).is_ok());
        assert_eq!(
            Coordinates::new(91.0, 0.0),
            Err(ValidationError::Latitude(91.0))
        );
        assert_eq!(
            Coordinates::new(0.0, -180.5),
            Err(ValidationError::Longitude(-180.5))
        );
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn region_requires_three_distinct_vertices() {
        let a = Coordinates { lat: 0.0, lng: 0.0 };
        let b = Coordinates { lat: 0.0, lng: 1.0 };
        let c = Coordinates { lat: 1.0, lng: 1.0 };
        assert!(Region::new(1, "closed", vec![a, b, c, a]).is_ok());
        assert_eq!(
            Region::new(1, "degenerate", vec![a, b, a]),
            Err(ValidationError::Boundary(2))
        );
    }

    #[test]
    fn severity_weights_increase() {
        for pair in Severity::all().windows(2) {
            assert!(pair[0].weight() < pair[1].weight());
        }
        assert_eq!("CRITICAL".parse::<Severity>(), Ok(Severity::Critical));
    }

    #[test]
    fn status_behavior() {
        assert!(OccurrenceStatus::Verified.counts_toward_risk());
        assert!(OccurrenceStatus::Resolved.counts_toward_risk());
        assert!(!OccurrenceStatus::Rejected.counts_toward_risk());
        assert!(!OccurrenceStatus::Expired.counts_toward_risk());
        assert!(OccurrenceStatus::Expired.is_terminal());
        assert!(!OccurrenceStatus::Pending.is_terminal());
    }

    #[test]
    fn collaborative_occurrences_expire_after_a_week() {
        let now = Utc::now();
        let mut occurrence = Occurrence {
            id: 1,
            location: Coordinates { lat: 0.0, lng: 0.0 },
            crime_type_id: 3,
            severity: Severity::High,
            confidence_score: 80,
            source: OccurrenceSource::Collaborative,
            created_by: Some(9),
            region_id: None,
            timestamp: now - chrono::Duration::days(8),
            status: OccurrenceStatus::Pending,
        };
        assert!(occurrence.is_expired_at(now));

        occurrence.source = OccurrenceSource::Official;
        assert!(!occurrence.is_expired_at(now));
    }

    #[test]
    fn risk_levels() {
        assert_eq!(RiskLevel::from_index(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_index(69.99), RiskLevel::Elevated);
        assert_eq!(RiskLevel::from_index(70.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_index(95.0), RiskLevel::Critical);
    }
}
