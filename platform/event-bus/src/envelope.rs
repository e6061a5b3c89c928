//! # Event Envelope
//!
//! The canonical unit of stream data carried across the broker.
//!
//! ## Wire Format
//!
//! Envelopes serialize to a flat JSON object:
//!
//! - `id`: Unique identifier (UUID v4 string unless supplied by the caller)
//! - `type`: Event category as a snake_case string (`user_action`, `transaction`, ...)
//! - `source`: Free-text origin identifier
//! - `payload`: Ordered field map (insertion order is preserved on the wire)
//! - `timestamp`: ISO 8601 event time (distinct from processing time)
//! - `version`: Schema version, defaults to `"1.0"`
//! - `metadata`: Auxiliary map, defaults to `{}`
//! - `correlation_id`: Links events in one causal chain (omitted when absent)
//! - `causation_id`: The event that directly produced this one (omitted when absent)
//!
//! Envelopes are immutable once published. Follow-up events are new envelopes
//! built with [`EventEnvelope::derive`], which links them back to their parent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default schema version stamped on new envelopes
pub const DEFAULT_ENVELOPE_VERSION: &str = "1.0";

/// Closed set of event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserAction,
    SystemEvent,
    BusinessEvent,
    SensorData,
    Transaction,
    Alert,
    Metric,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::UserAction,
        EventType::SystemEvent,
        EventType::BusinessEvent,
        EventType::SensorData,
        EventType::Transaction,
        EventType::Alert,
        EventType::Metric,
    ];

    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserAction => "user_action",
            EventType::SystemEvent => "system_event",
            EventType::BusinessEvent => "business_event",
            EventType::SensorData => "sensor_data",
            EventType::Transaction => "transaction",
            EventType::Alert => "alert",
            EventType::Metric => "metric",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Stream event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventEnvelope, EventType};
/// use serde_json::json;
///
/// let login = EventEnvelope::new(
///     EventType::UserAction,
///     "auth-service",
///     json!({"user_id": "u-1", "action": "login", "status": "failed"}),
/// )
/// .with_correlation_id(Some("session-42".to_string()));
///
/// assert_eq!(login.payload_field("action"), Some(&json!("login")));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier
    pub id: String,

    /// Event category
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Origin of the event (service, device, job, ...)
    pub source: String,

    /// Event-specific data
    pub payload: Map<String, Value>,

    /// Event time
    pub timestamp: DateTime<Utc>,

    /// Schema version of the payload
    #[serde(default = "default_version")]
    pub version: String,

    /// Auxiliary key/value data
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Links related events in one causal chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// The event that directly produced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

fn default_version() -> String {
    DEFAULT_ENVELOPE_VERSION.to_string()
}

impl EventEnvelope {
    /// Create a new envelope stamped with a fresh id and the current time
    ///
    /// A non-object `payload` is stored under a single `value` field.
    pub fn new(event_type: EventType, source: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), event_type, source, payload)
    }

    /// Create an envelope with an explicit id (useful for testing)
    pub fn with_id(
        id: impl Into<String>,
        event_type: EventType,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Self {
            id: id.into(),
            event_type,
            source: source.into(),
            payload,
            timestamp: Utc::now(),
            version: default_version(),
            metadata: Map::new(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Build a follow-up event caused by this one
    ///
    /// The child inherits the correlation id (or starts one from this event's
    /// id) and records this event as its cause.
    pub fn derive(&self, event_type: EventType, source: impl Into<String>, payload: Value) -> Self {
        let correlation_id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());

        EventEnvelope::new(event_type, source, payload)
            .with_correlation_id(Some(correlation_id))
            .with_causation_id(Some(self.id.clone()))
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Look up a payload field; dotted paths descend into nested objects
    pub fn payload_field(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.payload.get(path) {
            return Some(value);
        }

        let mut parts = path.split('.');
        let mut current = self.payload.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Payload field rendered as a plain string (strings are not quoted)
    pub fn payload_field_string(&self, path: &str) -> Option<String> {
        self.payload_field(path).map(value_to_plain_string)
    }

    /// Serialized size of the payload in bytes
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Render a JSON value without quoting strings
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Validate a raw envelope before full deserialization
///
/// # Validation Rules
///
/// - `id`: Must be a non-empty string
/// - `type`: Must be a known event type
/// - `source`: Must be a non-empty string
/// - `timestamp`: Must be an RFC 3339 string
/// - `payload`: Must be an object when present
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), String> {
    let id = envelope
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid id")?;

    if id.is_empty() {
        return Err("id cannot be empty".to_string());
    }

    let event_type = envelope
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid type")?;
    EventType::from_str(event_type)?;

    let source = envelope
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid source")?;

    if source.is_empty() {
        return Err("source cannot be empty".to_string());
    }

    let timestamp = envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;
    DateTime::parse_from_rfc3339(timestamp).map_err(|e| format!("invalid timestamp: {}", e))?;

    if let Some(payload) = envelope.get("payload") {
        if !payload.is_object() {
            return Err("payload must be an object".to_string());
        }
    }

    Ok(())
}
