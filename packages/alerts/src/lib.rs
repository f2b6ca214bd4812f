#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Proximity alerts for pedestrians.
//!
//! [`AlertService`] combines a position, a travel speed and the user's
//! [`AlertPreference`] with current region risk to decide which alerts to
//! raise. The look-ahead distance grows with speed so faster travellers are
//! warned earlier.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDateTime, Utc};
use safewalk_risk::{RiskError, RiskService};
use safewalk_risk_models::{
    AlertPreference, BoundingBox, Coordinates, HIGH_RISK_THRESHOLD, Occurrence, Region, Severity,
    ValidationError,
};
use safewalk_spatial::{RegionLookup, distance_m};
use safewalk_store::{OccurrenceRepository, PreferenceRepository, RegionRepository, StoreError};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Errors that can occur while evaluating alerts.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// Position or waypoint out of range.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Region occurrences could not be read.
    #[error(transparent)]
    Risk(#[from] RiskError),

    /// `recent_occurrence_hours` does not fit the calendar.
    #[error("Lookback of {0} hours is out of range")]
    InvalidLookback(i64),
}

/// Alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Region risk at or above which alerts are raised.
    pub high_risk_threshold: f64,
    /// Region risk at or above which alerts are critical.
    pub critical_risk_threshold: f64,
    /// How far back a reported occurrence still triggers an alert.
    pub recent_occurrence_hours: i64,
    /// Cap on recent-occurrence alerts per evaluation, nearest first.
    pub max_recent_alerts: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            high_risk_threshold: HIGH_RISK_THRESHOLD,
            critical_risk_threshold: 90.0,
            recent_occurrence_hours: 24,
            max_recent_alerts: 5,
        }
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertType {
    /// The position is inside a high-risk region.
    EnteringHighRisk,
    /// A waypoint ahead lies in a high-risk region.
    ApproachingHighRisk,
    /// A serious occurrence was reported nearby.
    RecentOccurrence,
}

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
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertSeverity {
    /// Risk at or above the high-risk threshold, or a high-severity
    /// report.
    High,
    /// Risk at or above the critical threshold, or a critical report.
    Critical,
}

/// One alert for the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Serialized as `type`.
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// Human-readable text naming the region or occurrence.
    pub message: String,
    /// Region the alert concerns. `None` for an occurrence outside any
    /// region.
    pub region_id: Option<i64>,
    pub region_name: Option<String>,
    /// Distance from the current position, when the alert is about
    /// something ahead or nearby.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    /// Risk index of the region, or `0` when there is none.
    pub risk_index: f64,
}

/// Alerts raised for one position plus the look-ahead distance used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertEvaluation {
    /// Alerts in the order they were raised: current region, regions
    /// ahead, then nearby occurrences.
    pub alerts: Vec<Alert>,
    /// Look-ahead distance in meters from [`calculate_alert_distance`].
    pub alert_distance: f64,
}

/// Look-ahead distance in meters for a travel speed in km/h.
///
/// Non-decreasing in speed and at least 150 m. Negative or non-finite
/// speeds count as standing still.
#[must_use]
pub fn calculate_alert_distance(speed_kmh: f64) -> f64 {
    let speed = if speed_kmh.is_finite() {
        speed_kmh.max(0.0)
    } else {
        0.0
    };

    if speed < 6.0 {
        150.0
    } else if speed < 20.0 {
        300.0
    } else if speed < 50.0 {
        500.0
    } else {
        1000.0
    }
}

/// Evaluates alert conditions against current region risk.
pub struct AlertService {
    lookup: Arc<dyn RegionLookup>,
    regions: Arc<dyn RegionRepository>,
    occurrences: Arc<dyn OccurrenceRepository>,
    preferences: Arc<dyn PreferenceRepository>,
    risk: Arc<RiskService>,
    config: AlertConfig,
}

impl std::fmt::Debug for AlertService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AlertService {
    /// `lookup` must index the same regions that `regions` stores.
    #[must_use]
    pub fn new(
        lookup: Arc<dyn RegionLookup>,
        regions: Arc<dyn RegionRepository>,
        occurrences: Arc<dyn OccurrenceRepository>,
        preferences: Arc<dyn PreferenceRepository>,
        risk: Arc<RiskService>,
        config: AlertConfig,
    ) -> Self {
        Self {
            lookup,
            regions,
            occurrences,
            preferences,
            risk,
            config,
        }
    }

    /// Alerts for the region containing `position` and for serious
    /// occurrences reported nearby, using the local clock.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] for an invalid position or a store failure.
    pub async fn check_alert_conditions(
        &self,
        position: Coordinates,
        speed_kmh: f64,
        preferences: Option<&AlertPreference>,
    ) -> Result<AlertEvaluation, AlertError> {
        let now = Local::now().fixed_offset();
        self.check_alert_conditions_at(position, speed_kmh, preferences, now)
            .await
    }

    /// [`Self::check_alert_conditions`] at an explicit time. The schedule
    /// in `preferences` is evaluated against `now`'s local wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] for an invalid position or a store failure.
    pub async fn check_alert_conditions_at(
        &self,
        position: Coordinates,
        speed_kmh: f64,
        preferences: Option<&AlertPreference>,
        now: DateTime<FixedOffset>,
    ) -> Result<AlertEvaluation, AlertError> {
        position.validate()?;
        let alert_distance = calculate_alert_distance(speed_kmh);
        let mut evaluation = AlertEvaluation {
            alerts: Vec::new(),
            alert_distance,
        };

        if !schedule_allows(preferences, now.naive_local()) {
            log::debug!("Alerts suppressed by schedule at {now}");
            return Ok(evaluation);
        }
        let utc = now.with_timezone(&Utc);

        if let Some(region_id) = self.lookup.region_at(&position) {
            if let Some(region) = self.alerting_region(region_id, preferences, utc).await? {
                evaluation.alerts.push(Alert {
                    alert_type: AlertType::EnteringHighRisk,
                    severity: self.region_severity(&region),
                    message: format!(
                        "You are in {}, a high-risk area (risk index {:.0}).",
                        region.name, region.risk_index
                    ),
                    region_id: Some(region.id),
                    region_name: Some(region.name),
                    distance_m: None,
                    risk_index: region.risk_index,
                });
            }
        }

        let recent = self
            .recent_occurrence_alerts(position, alert_distance, preferences, utc)
            .await?;
        evaluation.alerts.extend(recent);

        Ok(evaluation)
    }

    /// "Approaching" alerts for high-risk regions at waypoints within the
    /// alert distance, using the local clock.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] for an invalid coordinate or a store failure.
    pub async fn check_approaching_alerts(
        &self,
        position: Coordinates,
        speed_kmh: f64,
        waypoints: &[Coordinates],
        preferences: Option<&AlertPreference>,
    ) -> Result<AlertEvaluation, AlertError> {
        self.check_approaching_alerts_at(
            position,
            speed_kmh,
            waypoints,
            preferences,
            Local::now().fixed_offset(),
        )
        .await
    }

    /// [`Self::check_approaching_alerts`] at an explicit time.
    ///
    /// The region containing `position` is never reported as approaching,
    /// since [`Self::check_alert_conditions_at`] already covers it, and
    /// each region is reported at most once, at its nearest waypoint.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] for an invalid coordinate or a store failure.
    pub async fn check_approaching_alerts_at(
        &self,
        position: Coordinates,
        speed_kmh: f64,
        waypoints: &[Coordinates],
        preferences: Option<&AlertPreference>,
        now: DateTime<FixedOffset>,
    ) -> Result<AlertEvaluation, AlertError> {
        position.validate()?;
        for waypoint in waypoints {
            waypoint.validate()?;
        }
        let alert_distance = calculate_alert_distance(speed_kmh);
        let mut evaluation = AlertEvaluation {
            alerts: Vec::new(),
            alert_distance,
        };

        if !schedule_allows(preferences, now.naive_local()) {
            return Ok(evaluation);
        }
        let utc = now.with_timezone(&Utc);

        let mut nearby: Vec<(f64, &Coordinates)> = waypoints
            .iter()
            .map(|w| (distance_m(&position, w), w))
            .filter(|(d, _)| *d <= alert_distance)
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut seen: BTreeSet<i64> = self.lookup.region_at(&position).into_iter().collect();

        for (distance, waypoint) in nearby {
            let Some(region_id) = self.lookup.region_at(waypoint) else {
                continue;
            };
            if !seen.insert(region_id) {
                continue;
            }
            let Some(region) = self.alerting_region(region_id, preferences, utc).await? else {
                continue;
            };
            evaluation.alerts.push(Alert {
                alert_type: AlertType::ApproachingHighRisk,
                severity: self.region_severity(&region),
                message: format!(
                    "High-risk area {} ahead in {distance:.0} m (risk index {:.0}).",
                    region.name, region.risk_index
                ),
                region_id: Some(region.id),
                region_name: Some(region.name),
                distance_m: Some(distance),
                risk_index: region.risk_index,
            });
        }

        Ok(evaluation)
    }

    /// Runs both checks and merges them.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] for an invalid coordinate or a store failure.
    pub async fn evaluate_at(
        &self,
        position: Coordinates,
        speed_kmh: f64,
        waypoints: &[Coordinates],
        preferences: Option<&AlertPreference>,
        now: DateTime<FixedOffset>,
    ) -> Result<AlertEvaluation, AlertError> {
        let mut evaluation = self
            .check_alert_conditions_at(position, speed_kmh, preferences, now)
            .await?;
        let approaching = self
            .check_approaching_alerts_at(position, speed_kmh, waypoints, preferences, now)
            .await?;

        let alerted: BTreeSet<i64> = evaluation
            .alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::EnteringHighRisk)
            .filter_map(|a| a.region_id)
            .collect();
        evaluation.alerts.extend(
            approaching
                .alerts
                .into_iter()
                .filter(|a| a.region_id.is_none_or(|id| !alerted.contains(&id))),
        );

        Ok(evaluation)
    }

    /// [`Self::evaluate_at`] with the stored preferences of `user_id`.
    /// Users without stored preferences get every alert.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] for an invalid coordinate or a store failure.
    pub async fn evaluate_for_user(
        &self,
        user_id: i64,
        position: Coordinates,
        speed_kmh: f64,
        waypoints: &[Coordinates],
        now: DateTime<FixedOffset>,
    ) -> Result<AlertEvaluation, AlertError> {
        let preferences = self
            .preferences
            .preferences(user_id)
            .await?
            .unwrap_or_else(|| AlertPreference::enabled_for(user_id));
        self.evaluate_at(position, speed_kmh, waypoints, Some(&preferences), now)
            .await
    }

    /// The region, if it is high risk and one of its recent crime types is
    /// wanted.
    async fn alerting_region(
        &self,
        region_id: i64,
        preferences: Option<&AlertPreference>,
        now: DateTime<Utc>,
    ) -> Result<Option<Region>, AlertError> {
        let Some(region) = self.regions.region(region_id).await? else {
            return Ok(None);
        };
        if !region.is_high_risk(self.config.high_risk_threshold) {
            return Ok(None);
        }

        let filtered = preferences.is_some_and(|p| !p.enabled_crime_types.is_empty());
        if filtered {
            let recent = self.risk.contributing_occurrences(&region, now).await?;
            if !any_enabled(&recent, preferences) {
                log::debug!("Region {region_id}: no enabled crime types, not alerting");
                return Ok(None);
            }
        }

        Ok(Some(region))
    }

    async fn recent_occurrence_alerts(
        &self,
        position: Coordinates,
        radius_m: f64,
        preferences: Option<&AlertPreference>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, AlertError> {
        let hours = self.config.recent_occurrence_hours;
        let since = Duration::try_hours(hours.max(0))
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .ok_or(AlertError::InvalidLookback(hours))?;
        let candidates = self
            .occurrences
            .occurrences_within(&search_box(position, radius_m), since)
            .await?;

        let mut nearby: Vec<(f64, Occurrence)> = candidates
            .into_iter()
            .filter(|o| o.severity.is_alertable() && o.status.counts_toward_risk())
            .filter(|o| preferences.is_none_or(|p| p.is_crime_type_enabled(o.crime_type_id)))
            .map(|o| (distance_m(&position, &o.location), o))
            .filter(|(d, _)| *d <= radius_m)
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        nearby.truncate(self.config.max_recent_alerts);

        let mut alerts = Vec::with_capacity(nearby.len());
        for (distance, occurrence) in nearby {
            let region = match occurrence.region_id {
                Some(id) => self.regions.region(id).await?,
                None => None,
            };
            let hours = (now - occurrence.timestamp).num_hours().max(0);
            alerts.push(Alert {
                alert_type: AlertType::RecentOccurrence,
                severity: if occurrence.severity == Severity::Critical {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::High
                },
                message: format!(
                    "A {} severity incident was reported {distance:.0} m away {hours} h ago.",
                    occurrence.severity
                ),
                region_id: region.as_ref().map(|r| r.id),
                risk_index: region.as_ref().map_or(0.0, |r| r.risk_index),
                region_name: region.map(|r| r.name),
                distance_m: Some(distance),
            });
        }

        Ok(alerts)
    }

    fn region_severity(&self, region: &Region) -> AlertSeverity {
        if region.risk_index >= self.config.critical_risk_threshold {
            AlertSeverity::Critical
        } else {
            AlertSeverity::High
        }
    }
}

fn schedule_allows(preferences: Option<&AlertPreference>, local: NaiveDateTime) -> bool {
    preferences.is_none_or(|p| p.is_active_at(local))
}

fn any_enabled(occurrences: &[Occurrence], preferences: Option<&AlertPreference>) -> bool {
    let Some(preferences) = preferences else {
        return true;
    };
    occurrences
        .iter()
        .any(|o| preferences.is_crime_type_enabled(o.crime_type_id))
}

/// Box of roughly `radius_m` around `center`, clamped to valid ranges.
fn search_box(center: Coordinates, radius_m: f64) -> BoundingBox {
    const METERS_PER_DEGREE: f64 = 111_320.0;
    let dlat = radius_m / METERS_PER_DEGREE;
    let dlng = radius_m / (METERS_PER_DEGREE * center.lat.to_radians().cos().max(0.01));

    BoundingBox {
        min_lat: (center.lat - dlat).max(-90.0),
        min_lng: (center.lng - dlng).max(-180.0),
        max_lat: (center.lat + dlat).min(90.0),
        max_lng: (center.lng + dlng).min(180.0),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use safewalk_risk::RiskConfig;
    use safewalk_risk_models::{NewOccurrence, OccurrenceSource, OccurrenceStatus};
    use safewalk_spatial::RegionIndex;
    use safewalk_store::MemoryStore;

    use super::*;

    fn square(id: i64, min_lng: f64) -> Region {
        Region::new(
            id,
            format!("Block {id}"),
            vec![
                Coordinates { lat: 0.0, lng: min_lng },
                Coordinates { lat: 0.0, lng: min_lng + 0.01 },
                Coordinates { lat: 0.01, lng: min_lng + 0.01 },
                Coordinates { lat: 0.01, lng: min_lng },
            ],
        )
        .unwrap()
    }

    fn reported(
        lng: f64,
        crime_type_id: i64,
        severity: Severity,
        region_id: i64,
        timestamp: DateTime<Utc>,
    ) -> NewOccurrence {
        NewOccurrence {
            location: Coordinates { lat: 0.005, lng },
            crime_type_id,
            severity,
            confidence_score: 100,
            source: OccurrenceSource::Official,
            created_by: None,
            region_id: Some(region_id),
            timestamp,
            status: OccurrenceStatus::Verified,
        }
    }

    /// Wednesday 2026-03-11 at `hour`:`minute`, UTC.
    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        let naive = NaiveDate::from_ymd_opt(2026, 3, 11)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap();
        Utc.from_utc_datetime(&naive).fixed_offset()
    }

    /// Block 1 is quiet, block 2 is dangerous (type 7 robberies ten days
    /// ago) and block 3 had one fresh high-severity type 9 report.
    async fn service() -> AlertService {
        let store = Arc::new(MemoryStore::new());
        let regions = vec![square(1, 0.0), square(2, 0.01), square(3, 0.02)];
        let index = Arc::new(RegionIndex::build(&regions));
        store.insert_regions(regions).await.unwrap();

        let now = at(12, 0).with_timezone(&Utc);
        let mut batch: Vec<NewOccurrence> = (0..12)
            .map(|i| {
                reported(
                    0.0105 + f64::from(i) * 0.0007,
                    7,
                    Severity::Critical,
                    2,
                    now - Duration::days(10),
                )
            })
            .collect();
        batch.push(reported(0.0215, 9, Severity::High, 3, now - Duration::hours(3)));
        store.insert_occurrences(batch).await.unwrap();

        let risk = Arc::new(RiskService::new(
            store.clone(),
            store.clone(),
            RiskConfig::default(),
        ));
        for id in 1..=3 {
            risk.recalculate_region_risk_at(id, now).await.unwrap();
        }

        AlertService::new(
            index,
            store.clone(),
            store.clone(),
            store,
            risk,
            AlertConfig::default(),
        )
    }

    fn inside(block: i64) -> Coordinates {
        #[allow(clippy::cast_precision_loss)]
        let lng = (block - 1) as f64 * 0.01 + 0.005;
        Coordinates { lat: 0.005, lng }
    }

    #[test]
    fn alert_distance_is_monotonic_and_positive() {
        let speeds = [-5.0, 0.0, 3.0, 6.0, 12.0, 20.0, 35.0, 50.0, 120.0, f64::NAN];
        assert!(calculate_alert_distance(0.0) > 0.0);
        assert!((calculate_alert_distance(f64::NAN) - 150.0).abs() < f64::EPSILON);

        let finite: Vec<f64> = speeds[..9]
            .iter()
            .map(|s| calculate_alert_distance(*s))
            .collect();
        assert!(finite.windows(2).all(|w| w[0] <= w[1]), "{finite:?}");
    }

    #[tokio::test]
    async fn entering_high_risk_region_alerts() {
        let service = service().await;

        let evaluation = service
            .check_alert_conditions_at(inside(2), 4.0, None, at(12, 0))
            .await
            .unwrap();

        assert!((evaluation.alert_distance - 150.0).abs() < f64::EPSILON);
        let alert = &evaluation.alerts[0];
        assert_eq!(alert.alert_type, AlertType::EnteringHighRisk);
        assert_eq!(alert.region_name.as_deref(), Some("Block 2"));
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn out_of_range_lookback_is_an_error() {
        let service = AlertService {
            config: AlertConfig {
                recent_occurrence_hours: i64::MAX,
                ..AlertConfig::default()
            },
            ..service().await
        };

        let err = service
            .check_alert_conditions_at(inside(1), 4.0, None, at(12, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::InvalidLookback(i64::MAX)));
    }

    #[tokio::test]
    async fn quiet_region_raises_nothing() {
        let service = service().await;
        let evaluation = service
            .check_alert_conditions_at(inside(1), 4.0, None, at(12, 0))
            .await
            .unwrap();
        assert!(evaluation.alerts.is_empty());
    }

    #[tokio::test]
    async fn disabled_or_off_schedule_preferences_suppress_alerts() {
        let service = service().await;

        let mut off = AlertPreference::enabled_for(1);
        off.alerts_enabled = false;
        let evaluation = service
            .check_alert_conditions_at(inside(2), 4.0, Some(&off), at(12, 0))
            .await
            .unwrap();
        assert!(evaluation.alerts.is_empty());

        let night = AlertPreference::enabled_for(1)
            .with_active_hours("22:00", "06:00")
            .unwrap();
        for (hour, expected) in [(23, true), (3, true), (12, false)] {
            let evaluation = service
                .check_alert_conditions_at(inside(2), 4.0, Some(&night), at(hour, 0))
                .await
                .unwrap();
            assert_eq!(!evaluation.alerts.is_empty(), expected, "at {hour}:00");
        }

        // 2026-03-11 is a Wednesday (3).
        let weekends = AlertPreference::enabled_for(1).with_active_days([0, 6]).unwrap();
        let evaluation = service
            .check_alert_conditions_at(inside(2), 4.0, Some(&weekends), at(12, 0))
            .await
            .unwrap();
        assert!(evaluation.alerts.is_empty());
    }

    #[tokio::test]
    async fn crime_type_filter_uses_recent_region_types() {
        let service = service().await;

        let other = AlertPreference::enabled_for(1).with_crime_types([1, 2]);
        let evaluation = service
            .check_alert_conditions_at(inside(2), 4.0, Some(&other), at(12, 0))
            .await
            .unwrap();
        assert!(evaluation.alerts.is_empty());

        let robbery = AlertPreference::enabled_for(1).with_crime_types([7]);
        let evaluation = service
            .check_alert_conditions_at(inside(2), 4.0, Some(&robbery), at(12, 0))
            .await
            .unwrap();
        assert_eq!(evaluation.alerts.len(), 1);
    }

    #[tokio::test]
    async fn approaching_respects_distance_and_deduplicates() {
        let service = service().await;
        let position = Coordinates { lat: 0.005, lng: 0.0092 };
        let waypoints = [
            Coordinates { lat: 0.005, lng: 0.0095 },
            Coordinates { lat: 0.005, lng: 0.0101 },
            Coordinates { lat: 0.005, lng: 0.0103 },
            Coordinates { lat: 0.005, lng: 0.0115 },
        ];

        // walking: 150 m reaches block 2 at ~100 m but not ~256 m
        let walking = service
            .check_approaching_alerts_at(position, 4.0, &waypoints, None, at(12, 0))
            .await
            .unwrap();
        assert_eq!(walking.alerts.len(), 1);
        let alert = &walking.alerts[0];
        assert_eq!(alert.alert_type, AlertType::ApproachingHighRisk);
        assert_eq!(alert.region_id, Some(2));
        assert!(alert.distance_m.unwrap() <= 150.0);

        // already inside block 2: no approaching alert for it
        let ahead = [Coordinates { lat: 0.005, lng: 0.0151 }];
        let inside = service
            .evaluate_at(inside(2), 4.0, &ahead, None, at(12, 0))
            .await
            .unwrap();
        let block_2: Vec<_> = inside
            .alerts
            .iter()
            .filter(|a| a.region_id == Some(2))
            .collect();
        assert_eq!(block_2.len(), 1);
        assert_eq!(block_2[0].alert_type, AlertType::EnteringHighRisk);
    }

    #[tokio::test]
    async fn recent_serious_occurrence_nearby_alerts() {
        let service = service().await;

        let position = Coordinates { lat: 0.005, lng: 0.022 };
        let evaluation = service
            .check_alert_conditions_at(position, 4.0, None, at(12, 0))
            .await
            .unwrap();
        assert_eq!(evaluation.alerts.len(), 1);
        let alert = &evaluation.alerts[0];
        assert_eq!(alert.alert_type, AlertType::RecentOccurrence);
        assert_eq!(alert.region_name.as_deref(), Some("Block 3"));
        assert!(alert.message.contains("3 h ago"));

        let later = service
            .check_alert_conditions_at(position, 4.0, None, at(12, 0) + Duration::days(2))
            .await
            .unwrap();
        assert!(later.alerts.is_empty());
    }

    #[tokio::test]
    async fn invalid_position_is_rejected() {
        let service = service().await;
        let bad = Coordinates { lat: 100.0, lng: 0.0 };
        let err = service
            .check_alert_conditions_at(bad, 4.0, None, at(12, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Validation(_)));
    }

    #[test]
    fn alerts_serialize_with_type_field() {
        let alert = Alert {
            alert_type: AlertType::ApproachingHighRisk,
            severity: AlertSeverity::High,
            message: "ahead".to_string(),
            region_id: Some(1),
            region_name: Some("Block 1".to_string()),
            distance_m: None,
            risk_index: 75.0,
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "approaching_high_risk");
        assert_eq!(json["severity"], "high");
        assert!(json.get("distance_m").is_none());
    }
}
