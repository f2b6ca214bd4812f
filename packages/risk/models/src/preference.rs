//! Per-user alert preferences and the schedule/filter checks built on them.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// When and for what a user wants to receive alerts.
///
/// Empty sets mean "no restriction": an empty `enabled_crime_types`
/// enables every crime type and an empty `active_days` enables every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPreference {
    /// Owner of the preferences.
    pub user_id: i64,
    /// Master switch.
    pub alerts_enabled: bool,
    /// Crime type ids to alert on.
    #[serde(default)]
    pub enabled_crime_types: BTreeSet<i64>,
    /// Start of the daily active window.
    #[serde(default, with = "hhmm")]
    pub active_hours_start: Option<NaiveTime>,
    /// End of the daily active window (exclusive).
    #[serde(default, with = "hhmm")]
    pub active_hours_end: Option<NaiveTime>,
    /// Active weekdays, 0 = Sunday through 6 = Saturday.
    #[serde(default, deserialize_with = "weekdays::deserialize")]
    pub active_days: BTreeSet<u8>,
}

impl AlertPreference {
    /// Preferences with alerts on and no restrictions.
    #[must_use]
    pub const fn enabled_for(user_id: i64) -> Self {
        Self {
            user_id,
            alerts_enabled: true,
            enabled_crime_types: BTreeSet::new(),
            active_hours_start: None,
            active_hours_end: None,
            active_days: BTreeSet::new(),
        }
    }

    /// Sets the active window from `HH:mm` strings.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::TimeOfDay`] if either bound does not
    /// parse.
    pub fn with_active_hours(mut self, start: &str, end: &str) -> Result<Self, ValidationError> {
        self.active_hours_start = Some(parse_hhmm(start)?);
        self.active_hours_end = Some(parse_hhmm(end)?);
        Ok(self)
    }

    /// Restricts alerts to the given weekdays (0 = Sunday).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Weekday`] for values above 6.
    pub fn with_active_days(
        mut self,
        days: impl IntoIterator<Item = u8>,
    ) -> Result<Self, ValidationError> {
        self.active_days = validate_weekdays(days.into_iter().collect())?;
        Ok(self)
    }

    /// Restricts alerts to the given crime types.
    #[must_use]
    pub fn with_crime_types(mut self, crime_types: impl IntoIterator<Item = i64>) -> Self {
        self.enabled_crime_types = crime_types.into_iter().collect();
        self
    }

    /// Whether alerts for this crime type are wanted.
    #[must_use]
    pub fn is_crime_type_enabled(&self, crime_type_id: i64) -> bool {
        self.enabled_crime_types.is_empty() || self.enabled_crime_types.contains(&crime_type_id)
    }

    /// Whether alerts are wanted on this weekday.
    #[must_use]
    pub fn is_day_active(&self, weekday: Weekday) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let day = weekday.num_days_from_sunday() as u8;
        self.active_days.is_empty() || self.active_days.contains(&day)
    }

    /// Whether `time` falls inside the active window.
    ///
    /// A missing bound means always active, as does `start == end`. When
    /// `start > end` the window wraps past midnight.
    #[must_use]
    pub fn is_time_active(&self, time: NaiveTime) -> bool {
        let (Some(start), Some(end)) = (self.active_hours_start, self.active_hours_end) else {
            return true;
        };
        match start.cmp(&end) {
            std::cmp::Ordering::Less => time >= start && time < end,
            std::cmp::Ordering::Greater => time >= start || time < end,
            std::cmp::Ordering::Equal => true,
        }
    }

    /// Whether alerts are switched on and the schedule covers `now`.
    #[must_use]
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        self.alerts_enabled && self.is_day_active(now.weekday()) && self.is_time_active(now.time())
    }
}

/// Parses an `HH:mm` time of day.
///
/// # Errors
///
/// Returns [`ValidationError::TimeOfDay`] if the string is not `HH:mm`.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ValidationError::TimeOfDay(value.to_string()))
}

fn validate_weekdays(days: BTreeSet<u8>) -> Result<BTreeSet<u8>, ValidationError> {
    match days.iter().find(|d| **d > 6) {
        Some(bad) => Err(ValidationError::Weekday(*bad)),
        None => Ok(days),
    }
}

mod weekdays {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<u8>, D::Error> {
        super::validate_weekdays(BTreeSet::deserialize(deserializer)?)
            .map_err(serde::de::Error::custom)
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<NaiveTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.format("%H:%M").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| super::parse_hhmm(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn empty_crime_type_set_enables_everything() {
        let prefs = AlertPreference::enabled_for(1);
        for id in [0, 1, 42, i64::MAX] {
            assert!(prefs.is_crime_type_enabled(id));
        }

        let prefs = prefs.with_crime_types([3, 5]);
        assert!(prefs.is_crime_type_enabled(3));
        assert!(!prefs.is_crime_type_enabled(4));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let prefs = AlertPreference::enabled_for(1)
            .with_active_hours("22:00", "06:00")
            .unwrap();
        assert!(prefs.is_time_active(at(23, 0)));
        assert!(prefs.is_time_active(at(3, 0)));
        assert!(!prefs.is_time_active(at(12, 0)));
        assert!(!prefs.is_time_active(at(6, 0)));
        assert!(prefs.is_time_active(at(22, 0)));
    }

    #[test]
    fn daytime_window() {
        let prefs = AlertPreference::enabled_for(1)
            .with_active_hours("08:30", "17:00")
            .unwrap();
        assert!(prefs.is_time_active(at(8, 30)));
        assert!(!prefs.is_time_active(at(17, 0)));
        assert!(!prefs.is_time_active(at(7, 0)));
    }

    #[test]
    fn missing_bounds_are_always_active() {
        let mut prefs = AlertPreference::enabled_for(1);
        prefs.active_hours_start = Some(at(9, 0));
        assert!(prefs.is_time_active(at(3, 0)));
    }

    #[test]
    fn day_filter() {
        let prefs = AlertPreference::enabled_for(1);
        assert!(prefs.is_day_active(Weekday::Wed));

        let prefs = prefs.with_active_days([0, 6]).unwrap();
        assert!(prefs.is_day_active(Weekday::Sun));
        assert!(prefs.is_day_active(Weekday::Sat));
        assert!(!prefs.is_day_active(Weekday::Mon));

        assert_eq!(
            AlertPreference::enabled_for(1).with_active_days([7]),
            Err(ValidationError::Weekday(7))
        );
    }

    #[test]
    fn master_switch_overrides_schedule() {
        let mut prefs = AlertPreference::enabled_for(1);
        // 2026-10-17 is a Saturday.
        let now = NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert!(prefs.is_active_at(now));
        prefs.alerts_enabled = false;
        assert!(!prefs.is_active_at(now));
    }

    #[test]
    fn rejects_malformed_times() {
        assert!(parse_hhmm("25:00").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert_eq!(parse_hhmm(" 07:05 ").unwrap(), at(7, 5));
    }

    #[test]
    fn serializes_hours_as_hhmm() {
        let prefs = AlertPreference::enabled_for(7)
            .with_active_hours("22:00", "06:00")
            .unwrap();
        let json = serde_json::to_value(&prefs).unwrap();
        assert_eq!(json["active_hours_start"], "22:00");
        let back: AlertPreference = serde_json::from_value(json).unwrap();
        assert_eq!(back, prefs);
    }

    #[test]
    fn deserialized_weekdays_are_checked() {
        let ok: AlertPreference = serde_json::from_value(serde_json::json!({
            "user_id": 1,
            "alerts_enabled": true,
            "active_days": [1, 5]
        }))
        .unwrap();
        assert!(ok.is_day_active(Weekday::Fri));
        assert!(!ok.is_day_active(Weekday::Sun));

        let err = serde_json::from_value::<AlertPreference>(serde_json::json!({
            "user_id": 1,
            "alerts_enabled": true,
            "active_days": [1, 9]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid weekday 9"));
    }
}
