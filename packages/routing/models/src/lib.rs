#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Provider-neutral routing types.
//!
//! Every map provider adapter converts its responses into these types so
//! callers never see provider-specific payloads. Route geometry is always
//! carried as a Google-format encoded polyline (precision 5), see
//! [`polyline`].

pub mod polyline;

use chrono::{DateTime, Utc};
use safewalk_risk_models::Coordinates;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Maximum number of results returned by a geocode lookup.
pub const MAX_GEOCODE_RESULTS: usize = 5;

/// How the route will be travelled.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
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
pub enum TravelMode {
    /// On foot.
    #[default]
    Walking,
    /// By bicycle.
    Cycling,
    /// By car.
    Driving,
}

/// Optional knobs for a route request.
///
/// Part of the cache fingerprint, so field order and serialization must
/// stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Travel mode.
    #[serde(default)]
    pub mode: TravelMode,
    /// Avoid highways where the provider supports it.
    #[serde(default)]
    pub avoid_highways: bool,
    /// Avoid toll roads where the provider supports it.
    #[serde(default)]
    pub avoid_tolls: bool,
    /// Preferred response language (BCP 47), if any.
    #[serde(default)]
    pub language: Option<String>,
}

/// A route between two points, annotated with region risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Provider that computed the route.
    pub provider: String,
    /// Total length in meters.
    pub distance_m: f64,
    /// Expected travel time in seconds.
    pub duration_s: f64,
    /// Encoded polyline (Google format, precision 5).
    pub polyline: String,
    /// Turn-by-turn instructions in travel order.
    pub instructions: Vec<String>,
    /// Highest risk index of any region the route passes through.
    #[serde(default)]
    pub max_risk_index: f64,
    /// Mean risk index over the regions the route passes through.
    #[serde(default)]
    pub average_risk_index: f64,
    /// Whether the route crosses a high-risk region.
    #[serde(default)]
    pub requires_warning: bool,
    /// Human-readable warning when `requires_warning` is set.
    #[serde(default)]
    pub warning_message: Option<String>,
}

impl Route {
    /// Creates an unannotated route.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        distance_m: f64,
        duration_s: f64,
        polyline: String,
        instructions: Vec<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            distance_m,
            duration_s,
            polyline,
            instructions,
            max_risk_index: 0.0,
            average_risk_index: 0.0,
            requires_warning: false,
            warning_message: None,
        }
    }

    /// Decodes the route geometry.
    ///
    /// Returns an empty vector if the polyline is malformed.
    #[must_use]
    pub fn geometry(&self) -> Vec<Coordinates> {
        polyline::decode(&self.polyline).unwrap_or_default()
    }

    /// First and last vertex of the geometry.
    #[must_use]
    pub fn endpoints(&self) -> Option<(Coordinates, Coordinates)> {
        let geometry = self.geometry();
        Some((*geometry.first()?, *geometry.last()?))
    }
}

/// A geocoded address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    /// Full display form.
    pub formatted_address: String,
    /// Position of the address.
    pub coordinates: Coordinates,
    /// Street and house number.
    pub street: Option<String>,
    /// City or locality.
    pub city: Option<String>,
    /// State or region.
    pub state: Option<String>,
    /// Postal code.
    pub postal_code: Option<String>,
    /// Country name or code.
    pub country: Option<String>,
    /// Provider that resolved the address.
    pub provider: String,
}

/// Congestion classification derived from the traffic delay ratio.
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
pub enum TrafficLevel {
    /// Less than 10% slower than typical.
    Low,
    /// 10-30% slower.
    Moderate,
    /// 30-60% slower.
    Heavy,
    /// More than 60% slower.
    Severe,
    /// The provider gave no usable data.
    Unknown,
}

impl TrafficLevel {
    /// Classifies the ratio of in-traffic to typical duration.
    #[must_use]
    pub fn from_durations(typical_s: f64, in_traffic_s: f64) -> Self {
        if typical_s <= 0.0 || !in_traffic_s.is_finite() {
            return Self::Unknown;
        }
        let ratio = in_traffic_s / typical_s;
        if ratio < 1.1 {
            Self::Low
        } else if ratio < 1.3 {
            Self::Moderate
        } else if ratio < 1.6 {
            Self::Heavy
        } else {
            Self::Severe
        }
    }
}

/// Live traffic conditions along a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficData {
    /// Provider that supplied the data.
    pub provider: String,
    /// Congestion classification.
    pub level: TrafficLevel,
    /// Duration without traffic, in seconds.
    pub typical_duration_s: f64,
    /// Duration with current traffic, in seconds.
    pub duration_in_traffic_s: f64,
    /// Extra time caused by traffic, in seconds (never negative).
    pub delay_s: f64,
    /// When the data was fetched.
    pub observed_at: DateTime<Utc>,
}

impl TrafficData {
    /// Builds traffic data, deriving the level and delay.
    #[must_use]
    pub fn from_durations(
        provider: impl Into<String>,
        typical_duration_s: f64,
        duration_in_traffic_s: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.into(),
            level: TrafficLevel::from_durations(typical_duration_s, duration_in_traffic_s),
            typical_duration_s,
            duration_in_traffic_s,
            delay_s: (duration_in_traffic_s - typical_duration_s).max(0.0),
            observed_at,
        }
    }
}
