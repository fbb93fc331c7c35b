//! Funnel records: one row per browser session and questionnaire, holding the furthest
//! point the visitor reached in a multi-step intake form.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The questionnaires that track abandonment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FunnelKind {
    WeightLoss,
    Ed,
    Longevity,
    SkinHair,
    Refills,
}

impl FunnelKind {
    pub const ALL: [FunnelKind; 5] = [
        FunnelKind::WeightLoss,
        FunnelKind::Ed,
        FunnelKind::Longevity,
        FunnelKind::SkinHair,
        FunnelKind::Refills,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelKind::WeightLoss => "weight-loss",
            FunnelKind::Ed => "ed",
            FunnelKind::Longevity => "longevity",
            FunnelKind::SkinHair => "skin-hair",
            FunnelKind::Refills => "refills",
        }
    }
}

impl fmt::Display for FunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid FunnelKind")]
pub struct ParseFunnelKindError(pub String);

impl FromStr for FunnelKind {
    type Err = ParseFunnelKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FunnelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseFunnelKindError(s.to_owned()))
    }
}

/// Contact details captured on the first page of a questionnaire.
/// Unknown keys sent by the form are kept as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelRecord {
    pub kind: FunnelKind,
    pub user_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_segment: Option<FirstSegment>,
    pub last_segment_reached: Option<i32>,
    pub state: Option<i32>,
    pub seen: bool,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunnelRecord {
    /// A record as first written for a session.
    pub fn new(kind: FunnelKind, update: FunnelUpdate, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            user_session_id: update.user_session_id,
            first_segment: update.first_segment,
            last_segment_reached: update.last_segment_reached,
            state: update.state,
            seen: false,
            timestamp: update.timestamp,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow overwrite: fields present in the update replace the stored ones wholesale,
    /// absent fields are left untouched. `seen` is never changed by a form submission.
    pub fn apply(&mut self, update: FunnelUpdate, now: DateTime<Utc>) {
        if let Some(first_segment) = update.first_segment {
            self.first_segment = Some(first_segment);
        }
        if let Some(last_segment_reached) = update.last_segment_reached {
            self.last_segment_reached = Some(last_segment_reached);
        }
        if let Some(state) = update.state {
            self.state = Some(state);
        }
        self.timestamp = update.timestamp;
        self.updated_at = now;
    }
}

/// A validated progress report for one session, ready to be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct FunnelUpdate {
    pub user_session_id: String,
    pub first_segment: Option<FirstSegment>,
    pub last_segment_reached: Option<i32>,
    pub state: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("userSessionId is required")]
pub struct MissingSessionId;

/// The body a questionnaire page posts when the visitor moves between segments.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelSubmission {
    #[serde(default)]
    pub user_session_id: Option<String>,
    #[serde(default)]
    pub first_segment: Option<FirstSegment>,
    #[serde(default, deserialize_with = "deserialize_segment")]
    pub last_segment_reached: Option<i32>,
    /// Kept loose on purpose: anything that is not an integer is ignored instead of
    /// overwriting a stored state.
    #[serde(default)]
    pub state: Option<Value>,
    /// RFC 3339 string or epoch milliseconds, as sent by `Date.now()`.
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An integer carried by a JSON number, including integral floats such as `2.0`.
pub fn integral_i32(value: &Value) -> Option<i32> {
    if let Some(n) = value.as_i64() {
        return i32::try_from(n).ok();
    }

    let n = value.as_f64()?;
    if n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) {
        Some(n as i32)
    } else {
        None
    }
}

fn deserialize_segment<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => integral_i32(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid segment {value}, expected an integer"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClientTimestamp {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<ClientTimestamp>::deserialize(deserializer)? {
        None => Ok(None),
        Some(ClientTimestamp::Rfc3339(timestamp)) => Ok(Some(timestamp)),
        Some(ClientTimestamp::EpochMillis(millis)) => Utc
            .timestamp_millis_opt(millis)
            .single()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("timestamp {millis} is out of range"))),
    }
}

impl FunnelSubmission {
    pub fn into_update(self, now: DateTime<Utc>) -> Result<FunnelUpdate, MissingSessionId> {
        let user_session_id = self
            .user_session_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(MissingSessionId)?;

        let state = self.state.as_ref().and_then(integral_i32);

        Ok(FunnelUpdate {
            user_session_id,
            first_segment: self.first_segment,
            last_segment_reached: self.last_segment_reached,
            state,
            timestamp: self.timestamp.unwrap_or(now),
        })
    }
}
