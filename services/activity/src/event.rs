//! Activity event model and validation.
//!
//! `ActivityEvent` is the wire shape published to Kafka and accepted by the
//! aggregator. It is deliberately loose (string action, signed user id) so
//! that anything a producer sends can be decoded; `validate` and `prepare`
//! turn it into a `ValidatedEvent` or a `ValidationError`.

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Reasons an event is rejected before any side effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid user id {0}")]
    InvalidUserId(i64),

    #[error("invalid action {0:?}")]
    InvalidAction(String),
}

/// Recognized user actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Upload,
    Delete,
    Share,
    Download,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Upload,
        Action::Delete,
        Action::Share,
        Action::Download,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::Delete => "delete",
            Action::Share => "share",
            Action::Download => "download",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Action::Upload),
            "delete" => Ok(Action::Delete),
            "share" => Ok(Action::Share),
            "download" => Ok(Action::Download),
            other => Err(ValidationError::InvalidAction(other.to_string())),
        }
    }
}

/// One user action as carried on the activity topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique event ID used for deduplication
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_id: String,
    /// Acting user
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_id: i64,
    /// One of upload, delete, share, download
    #[serde(default, deserialize_with = "null_as_default")]
    pub action: String,
    /// File the action touched, if any
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero_u64"
    )]
    pub file_id: u64,
    /// Size of the file in bytes
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero_i64"
    )]
    pub file_bytes: i64,
    /// When the action happened
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

// JSON null decodes as the field's zero value
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// An event that passed validation, with defaults resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    /// Empty when the producer did not supply one
    pub event_id: String,
    pub user_id: i64,
    pub action: Action,
    pub file_id: u64,
    /// Never negative
    pub file_bytes: i64,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    /// Build a fresh event with a generated ID stamped at the current time
    pub fn new(user_id: i64, action: Action, file_id: u64, file_bytes: i64) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id,
            action: action.as_str().to_string(),
            file_id,
            file_bytes,
            occurred_at: Some(Utc::now()),
        }
    }

    /// Check the event without modifying it. Missing timestamps resolve to `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<ValidatedEvent, ValidationError> {
        if self.user_id <= 0 {
            return Err(ValidationError::InvalidUserId(self.user_id));
        }
        let action: Action = self.action.parse()?;

        Ok(ValidatedEvent {
            event_id: self.event_id.clone(),
            user_id: self.user_id,
            action,
            file_id: self.file_id,
            file_bytes: self.file_bytes.max(0),
            occurred_at: self.effective_occurred_at().unwrap_or(now),
        })
    }

    /// Validate for publishing and fill in a missing event ID and timestamp
    pub fn prepare(&mut self, now: DateTime<Utc>) -> Result<ValidatedEvent, ValidationError> {
        let validated = self.validate(now)?;
        if self.event_id.is_empty() {
            self.event_id = Uuid::new_v4().to_string();
        }
        if self.effective_occurred_at().is_none() {
            self.occurred_at = Some(validated.occurred_at);
        }
        Ok(ValidatedEvent {
            event_id: self.event_id.clone(),
            ..validated
        })
    }

    // Producers that serialize an unset timestamp send 0001-01-01T00:00:00Z.
    fn effective_occurred_at(&self) -> Option<DateTime<Utc>> {
        self.occurred_at.filter(|at| at.year() > 1)
    }
}

/// How event timestamps are bucketed into calendar days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DayBucket {
    #[default]
    Utc,
    /// The host's local timezone
    Local,
    Fixed(FixedOffset),
}

impl DayBucket {
    /// Calendar day an instant falls on
    pub fn stat_date(&self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            DayBucket::Utc => at.date_naive(),
            DayBucket::Local => at.with_timezone(&Local).date_naive(),
            DayBucket::Fixed(offset) => at.with_timezone(offset).date_naive(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.stat_date(Utc::now())
    }
}

impl FromStr for DayBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "utc" | "z" | "" => Ok(DayBucket::Utc),
            "local" => Ok(DayBucket::Local),
            other => parse_offset(other)
                .map(DayBucket::Fixed)
                .ok_or_else(|| format!("unrecognized day bucket {:?}", s)),
        }
    }
}

impl TryFrom<String> for DayBucket {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Parse `+HH:MM`, `-HH:MM` or `+HH`
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(user_id: i64, action: &str) -> ActivityEvent {
        ActivityEvent {
            event_id: "evt-1".to_string(),
            user_id,
            action: action.to_string(),
            file_id: 0,
            file_bytes: 0,
            occurred_at: None,
        }
    }

    #[test]
    fn test_rejects_zero_and_negative_user() {
        let now = Utc::now();
        assert_eq!(
            event(0, "upload").validate(now),
            Err(ValidationError::InvalidUserId(0))
        );
        assert_eq!(
            event(-3, "upload").validate(now),
            Err(ValidationError::InvalidUserId(-3))
        );
    }

    #[test]
    fn test_rejects_unknown_action() {
        let err = event(7, "rename").validate(Utc::now()).unwrap_err();
        assert_eq!(err, ValidationError::InvalidAction("rename".to_string()));
    }

    #[test]
    fn test_clamps_negative_bytes_and_defaults_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut raw = event(7, "upload");
        raw.file_bytes = -50;

        let validated = raw.validate(now).unwrap();
        assert_eq!(validated.file_bytes, 0);
        assert_eq!(validated.occurred_at, now);
        assert_eq!(validated.action, Action::Upload);
    }

    #[test]
    fn test_prepare_fills_missing_identifiers() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut raw = event(7, "share");
        raw.event_id.clear();

        let validated = raw.prepare(now).unwrap();
        assert!(!raw.event_id.is_empty());
        assert_eq!(validated.event_id, raw.event_id);
        assert_eq!(raw.occurred_at, Some(now));
    }

    #[test]
    fn test_prepare_keeps_existing_identifiers() {
        let at = Utc.with_ymd_and_hms(2024, 2, 28, 8, 0, 0).unwrap();
        let mut raw = event(7, "share");
        raw.occurred_at = Some(at);

        raw.prepare(Utc::now()).unwrap();
        assert_eq!(raw.event_id, "evt-1");
        assert_eq!(raw.occurred_at, Some(at));
    }

    #[test]
    fn test_zero_timestamp_treated_as_unset() {
        let json = r#"{
            "event_id": "abc",
            "user_id": 12,
            "action": "download",
            "file_bytes": 6,
            "occurred_at": "0001-01-01T00:00:00Z"
        }"#;
        let raw: ActivityEvent = serde_json::from_str(json).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        assert_eq!(raw.validate(now).unwrap().occurred_at, now);
    }

    #[test]
    fn test_null_fields_decode_as_zero_values() {
        let json = r#"{
            "event_id": null,
            "user_id": 3,
            "action": "upload",
            "file_id": null,
            "file_bytes": null,
            "occurred_at": null
        }"#;
        let raw: ActivityEvent = serde_json::from_str(json).unwrap();
        assert!(raw.event_id.is_empty());
        assert_eq!(raw.file_id, 0);
        assert_eq!(raw.file_bytes, 0);

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let validated = raw.validate(now).unwrap();
        assert_eq!(validated.action, Action::Upload);
        assert_eq!(validated.occurred_at, now);
    }

    #[test]
    fn test_null_user_is_rejected_not_undecodable() {
        let raw: ActivityEvent =
            serde_json::from_str(r#"{"user_id": null, "action": "share"}"#).unwrap();
        assert!(matches!(
            raw.validate(Utc::now()),
            Err(ValidationError::InvalidUserId(0))
        ));
    }

    #[test]
    fn test_decode_minimal_payload() {
        let raw: ActivityEvent = serde_json::from_str(r#"{"user_id": 3, "action": "delete"}"#).unwrap();
        assert!(raw.event_id.is_empty());
        assert_eq!(raw.file_bytes, 0);
        assert!(raw.occurred_at.is_none());
    }

    #[test]
    fn test_day_bucket_parsing() {
        assert_eq!("utc".parse::<DayBucket>().unwrap(), DayBucket::Utc);
        assert_eq!("Local".parse::<DayBucket>().unwrap(), DayBucket::Local);
        assert_eq!(
            "+08:00".parse::<DayBucket>().unwrap(),
            DayBucket::Fixed(FixedOffset::east_opt(8 * 3600).unwrap())
        );
        assert_eq!(
            "-05:30".parse::<DayBucket>().unwrap(),
            DayBucket::Fixed(FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap())
        );
        assert!("mars".parse::<DayBucket>().is_err());
        assert!("+25:00".parse::<DayBucket>().is_err());
    }

    #[test]
    fn test_fixed_offset_moves_day_boundary() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        let shanghai: DayBucket = "+08:00".parse().unwrap();

        assert_eq!(DayBucket::Utc.stat_date(at).to_string(), "2024-03-01");
        assert_eq!(shanghai.stat_date(at).to_string(), "2024-03-02");
    }
}
