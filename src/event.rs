//! Event model shared by the ingestion workers, the bus and the consumers.
//!
//! Producers build a typed [`Event`]. Consumers decode bus payloads into an
//! [`InboundEvent`], which keeps `object_details` as raw JSON so a payload
//! whose details do not match the [`DetectionRecord`] schema can still be
//! stored in degraded form instead of being dropped.

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Event type emitted when a novel tracked object appears.
pub const EVENT_OBJECT_DETECTED: &str = "object_detected";

/// Pixel-space bounding box, serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Builds a box with corners ordered so that `x1 <= x2` and `y1 <= y2`.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> i32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> i32 {
        self.y2.saturating_sub(self.y1)
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One detector output for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Present only when tracking is enabled and the detector assigned an identity.
    pub track_id: Option<i64>,
    #[serde(default)]
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

impl DetectionRecord {
    pub fn new(class_name: impl Into<String>, confidence: f64, bbox: BoundingBox) -> Self {
        Self {
            track_id: None,
            class_id: 0,
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }

    pub fn with_track_id(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_class_id(mut self, class_id: i64) -> Self {
        self.class_id = class_id;
        self
    }
}

/// An event as built by an ingestion worker and published on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "millis_rfc3339")]
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub event_type: String,
    pub object_details: Vec<DetectionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    pub snapshot_path: Option<String>,
}

impl Event {
    pub fn object_detected(
        timestamp: DateTime<Utc>,
        source_id: &str,
        object_details: Vec<DetectionRecord>,
        snapshot_path: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            source_id: source_id.to_string(),
            event_type: EVENT_OBJECT_DETECTED.to_string(),
            object_details,
            zone: None,
            snapshot_path,
        }
    }

    /// Representative confidence: the first detail's confidence.
    pub fn confidence(&self) -> Option<f64> {
        self.object_details.first().map(|d| d.confidence)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize event")
    }
}

/// An event as received by a consumer.
///
/// `timestamp` is kept verbatim (it is part of the alert dedup key and is
/// stored as text). `camera_id` is accepted for payloads from older producers.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundEvent {
    pub timestamp: String,
    #[serde(alias = "camera_id")]
    pub source_id: String,
    pub event_type: String,
    #[serde(default)]
    pub object_details: serde_json::Value,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

impl InboundEvent {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("decode bus message")
    }

    /// Entries of `object_details` that parse as detection records, in order.
    /// Entries that do not parse are skipped.
    pub fn detections(&self) -> Vec<DetectionRecord> {
        match &self.object_details {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// First detail's `confidence`, read leniently from the raw JSON.
    pub fn confidence(&self) -> Option<f64> {
        self.object_details
            .as_array()
            .and_then(|items| items.first())
            .and_then(|first| first.get("confidence"))
            .and_then(|c| c.as_f64())
    }
}

/// Serializes `object_details` for storage.
///
/// Details matching the record schema are stored exactly as received, extra
/// keys and corner order included. Anything else is stored as a JSON string
/// holding its textual representation. Empty or null details yield `None`.
pub fn encode_object_details(details: &serde_json::Value) -> Option<String> {
    match details {
        serde_json::Value::Null => return None,
        serde_json::Value::Array(items) if items.is_empty() => return None,
        _ => {}
    }
    if serde_json::from_value::<Vec<DetectionRecord>>(details.clone()).is_ok() {
        return Some(details.to_string());
    }
    log::warn!("object_details do not match the detection schema; storing text form");
    serde_json::to_string(&details.to_string()).ok()
}

/// Parses stored `object_details` text back into JSON, keeping unparsable
/// text as a JSON string.
pub fn decode_object_details(text: Option<&str>) -> serde_json::Value {
    match text {
        None => serde_json::Value::Null,
        Some(text) => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
    }
}

/// Fixed-width `YYYY-MM-DDTHH:MM:SS.mmmZ`, so stored timestamps order
/// correctly as text.
mod millis_rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Current UTC time truncated to millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
