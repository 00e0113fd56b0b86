//! Shared types for the sorter core

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current time as epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for trigger signal IDs reported by the actuation device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SignalId(pub u16);

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A physical object crossed the trigger point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSignal {
    pub id: SignalId,
    /// Receive time (epoch ms)
    pub received_at_ms: u64,
}

impl TriggerSignal {
    pub fn new(id: u16, received_at_ms: u64) -> Self {
        Self { id: SignalId(id), received_at_ms }
    }
}

/// Parcel dimensions in millimetres
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length: f64,
    pub width: f64,
    pub height: f64,
}

/// One capture report from the camera/scale subsystem
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelEvent {
    pub barcode: String,
    pub weight_kg: f64,
    pub dimensions: Dimensions,
    /// Capture time (epoch ms), on the acquisition clock
    pub arrived_at_ms: u64,
    /// Opaque image reference (path or URL), passed through untouched
    pub image_ref: Option<String>,
}

impl ParcelEvent {
    /// Parcel with only a barcode and capture time
    pub fn new(barcode: impl Into<String>, arrived_at_ms: u64) -> Self {
        Self {
            barcode: barcode.into(),
            weight_kg: 0.0,
            dimensions: Dimensions::default(),
            arrived_at_ms,
            image_ref: None,
        }
    }
}

/// Terminal state of a correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Matched,
    Timeout,
    NoMatch,
    BindingConflict,
    NoRead,
    /// Signal matched but the rule table has no chute for the barcode
    NoRule,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Matched => "matched",
            Outcome::Timeout => "timeout",
            Outcome::NoMatch => "no_match",
            Outcome::BindingConflict => "binding_conflict",
            Outcome::NoRead => "no_read",
            Outcome::NoRule => "no_rule",
        }
    }

    /// Whether this outcome routes to the exception chute
    pub fn is_exception(&self) -> bool {
        !matches!(self, Outcome::Matched)
    }
}

/// Sorting decision handed to the dispatcher exactly once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortDecision {
    pub decision_id: Uuid,
    /// Signal the decision is addressed to (None for no-read / no-match parcels)
    pub signal_id: Option<SignalId>,
    pub chute: u8,
    pub outcome: Outcome,
    /// Time between the triggering input and the decision (ms)
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    pub decided_at_ms: u64,
}

impl SortDecision {
    pub fn new(
        signal_id: Option<SignalId>,
        chute: u8,
        outcome: Outcome,
        barcode: Option<String>,
        origin_ms: u64,
    ) -> Self {
        let decided_at_ms = epoch_ms();
        Self {
            decision_id: Uuid::now_v7(),
            signal_id,
            chute,
            outcome,
            latency_ms: decided_at_ms.saturating_sub(origin_ms),
            barcode,
            decided_at_ms,
        }
    }
}

/// Parcel message as sent by the acquisition subsystem (one JSON object per line)
#[derive(Debug, Deserialize)]
pub struct ParcelMessage {
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    /// Capture timestamp - can be RFC 3339 string or epoch milliseconds integer
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub arrived_at: TimestampValue,
    #[serde(default)]
    pub image: Option<String>,
}

impl ParcelMessage {
    /// Convert to a ParcelEvent, stamping `fallback_ms` when no usable timestamp was sent
    pub fn into_event(self, fallback_ms: u64) -> ParcelEvent {
        ParcelEvent {
            barcode: self.barcode.unwrap_or_default(),
            weight_kg: self.weight,
            dimensions: Dimensions { length: self.length, width: self.width, height: self.height },
            arrived_at_ms: self.arrived_at.as_epoch_ms().unwrap_or(fallback_ms),
            image_ref: self.image,
        }
    }
}

/// Timestamp that can be either RFC 3339 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

impl TimestampValue {
    pub fn as_epoch_ms(&self) -> Option<u64> {
        match self {
            TimestampValue::None => None,
            TimestampValue::EpochMs(ms) => Some(*ms),
            TimestampValue::IsoString(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok()),
        }
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            // Negative epoch values are treated as missing
            Ok(u64::try_from(value).map(TimestampValue::EpochMs).unwrap_or(TimestampValue::None))
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_as_str() {
        assert_eq!(Outcome::Matched.as_str(), "matched");
        assert_eq!(Outcome::BindingConflict.as_str(), "binding_conflict");
        assert!(!Outcome::Matched.is_exception());
        assert!(Outcome::Timeout.is_exception());
        assert!(Outcome::NoRule.is_exception());
    }

    #[test]
    fn test_parcel_message_epoch_ms() {
        let msg: ParcelMessage = serde_json::from_str(
            r#"{"barcode":"ABC123","weight":1.25,"length":300,"arrived_at":1767617600300}"#,
        )
        .unwrap();
        let event = msg.into_event(0);
        assert_eq!(event.barcode, "ABC123");
        assert_eq!(event.arrived_at_ms, 1767617600300);
        assert_eq!(event.dimensions.length, 300.0);
        assert_eq!(event.weight_kg, 1.25);
    }

    #[test]
    fn test_parcel_message_rfc3339() {
        let msg: ParcelMessage =
            serde_json::from_str(r#"{"barcode":"X","arrived_at":"2026-01-05T10:00:00.300Z"}"#)
                .unwrap();
        assert_eq!(msg.into_event(0).arrived_at_ms, 1767607200300);
    }

    #[test]
    fn test_parcel_message_missing_fields_use_fallback() {
        let msg: ParcelMessage = serde_json::from_str(r#"{"image":"cam1/0001.jpg"}"#).unwrap();
        let event = msg.into_event(42);
        assert_eq!(event.barcode, "");
        assert_eq!(event.arrived_at_ms, 42);
        assert_eq!(event.image_ref.as_deref(), Some("cam1/0001.jpg"));
    }

    #[test]
    fn test_decision_latency_never_negative() {
        let decision =
            SortDecision::new(Some(SignalId(7)), 3, Outcome::Matched, None, u64::MAX);
        assert_eq!(decision.latency_ms, 0);
        assert_eq!(decision.signal_id, Some(SignalId(7)));
    }
}
