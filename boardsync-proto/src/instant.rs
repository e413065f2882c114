//! Timestamps as they appear in stored task documents.
//!
//! Years of schema drift left `createdAt`/`updatedAt` in three shapes:
//! the store's native timestamp object (or epoch milliseconds), an ISO-8601
//! string, or nothing at all. [`RawInstant`] keeps whichever shape arrived
//! and resolves it to a UTC instant on demand.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Naive (offset-less) layouts accepted after RFC 3339 fails, read as UTC.
const NAIVE_LAYOUTS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A document timestamp in the representation it was stored with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RawInstant {
    /// Native store timestamp (`{seconds, nanoseconds}` object or epoch millis).
    Native(DateTime<Utc>),
    /// String form, parsed lazily by [`resolve`](Self::resolve).
    Iso(String),
    /// Field missing, null, or of an unusable type.
    #[default]
    Absent,
}

impl RawInstant {
    /// Reads a timestamp field from a raw document value.
    #[must_use]
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::String(s)) => Self::Iso(s.clone()),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .map_or(Self::Absent, Self::Native),
            Some(Value::Object(map)) => {
                let seconds = map
                    .get("seconds")
                    .or_else(|| map.get("_seconds"))
                    .and_then(Value::as_i64);
                let nanos = map
                    .get("nanoseconds")
                    .or_else(|| map.get("_nanoseconds"))
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0);
                seconds
                    .and_then(|s| DateTime::from_timestamp(s, nanos))
                    .map_or(Self::Absent, Self::Native)
            }
            Some(_) => Self::Absent,
        }
    }

    /// Resolves to a UTC instant: native first, then a parseable string.
    ///
    /// Returns `None` for absent values and strings no accepted layout matches.
    #[must_use]
    pub fn resolve(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Native(at) => Some(*at),
            Self::Iso(raw) => parse_iso(raw),
            Self::Absent => None,
        }
    }

    /// Returns `true` if no timestamp was present.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Converts back to a document value for passthrough writes.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Native(at) => Value::String(at.to_rfc3339()),
            Self::Iso(raw) => Value::String(raw.clone()),
            Self::Absent => Value::Null,
        }
    }
}

impl From<DateTime<Utc>> for RawInstant {
    fn from(at: DateTime<Utc>) -> Self {
        Self::Native(at)
    }
}

impl Serialize for RawInstant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
