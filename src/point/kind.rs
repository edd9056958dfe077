//! Point kinds and their payload conversions
//!
//! Every payload on the wire is UTF-8 text. Each [`PointKind`] owns both
//! directions of the conversion: [`PointKind::coerce`] for inbound payloads and
//! [`PointKind::encode_control`] for outbound control values.

use crate::error::BridgeError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::PointId;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Declared value kind of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    /// 8-bit discrete state
    #[serde(alias = "discrete")]
    Digital,
    /// Floating point measurement
    #[serde(alias = "numeric")]
    Analogue,
    /// Free text
    #[serde(rename = "string")]
    Text,
    /// Date-time value, read-only
    #[serde(alias = "time")]
    Timestamp,
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PointKind::Digital => "digital",
            PointKind::Analogue => "analogue",
            PointKind::Text => "string",
            PointKind::Timestamp => "timestamp",
        };
        write!(f, "{}", name)
    }
}

/// A typed point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointValue {
    Digital(u8),
    Analogue(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl PointValue {
    pub fn kind(&self) -> PointKind {
        match self {
            PointValue::Digital(_) => PointKind::Digital,
            PointValue::Analogue(_) => PointKind::Analogue,
            PointValue::Text(_) => PointKind::Text,
            PointValue::Timestamp(_) => PointKind::Timestamp,
        }
    }

    /// Equality used for change detection; floats compare bit-wise so a
    /// repeated NaN does not count as a change.
    pub fn same_as(&self, other: &PointValue) -> bool {
        match (self, other) {
            (PointValue::Analogue(a), PointValue::Analogue(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    /// Canonical text form
    pub fn to_text(&self) -> String {
        match self {
            PointValue::Digital(v) => v.to_string(),
            PointValue::Analogue(v) => v.to_string(),
            PointValue::Text(v) => v.clone(),
            PointValue::Timestamp(v) => v.to_rfc3339(),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

/// Quality attached to a written value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    /// Never written by the bridge
    #[default]
    Unknown,
    Good,
    Bad,
}

impl PointKind {
    /// Converts a raw payload into this kind's native value.
    pub fn coerce(&self, payload: &[u8]) -> Result<PointValue, BridgeError> {
        let text = std::str::from_utf8(payload).map_err(|e| BridgeError::Coercion {
            kind: *self,
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason: e.to_string(),
        })?;

        let fail = |reason: String| BridgeError::Coercion {
            kind: *self,
            payload: text.to_string(),
            reason,
        };

        match self {
            PointKind::Digital => text
                .trim()
                .parse::<u8>()
                .map(PointValue::Digital)
                .map_err(|e| fail(e.to_string())),
            PointKind::Analogue => text
                .trim()
                .parse::<f64>()
                .map(PointValue::Analogue)
                .map_err(|e| fail(e.to_string())),
            PointKind::Text => Ok(PointValue::Text(text.to_string())),
            PointKind::Timestamp => parse_timestamp(text.trim())
                .map(PointValue::Timestamp)
                .ok_or_else(|| fail("not a recognised date-time literal".to_string())),
        }
    }

    /// Serializes a control value for publishing.
    pub fn encode_control(&self, point: PointId, value: &PointValue) -> Result<Vec<u8>, BridgeError> {
        match self {
            PointKind::Timestamp => Err(BridgeError::UnsupportedControl { point, kind: *self }),
            kind if value.kind() != *kind => Err(BridgeError::ControlValueMismatch {
                point,
                expected: *kind,
            }),
            _ => Ok(value.to_text().into_bytes()),
        }
    }

    /// Whether outbound control is possible for this kind
    pub fn is_controllable(&self) -> bool {
        !matches!(self, PointKind::Timestamp)
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
