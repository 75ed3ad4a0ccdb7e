//! Event records and their priority class.
//!
//! An event is a flat JSON object. Two keys are always present once an event
//! has been recorded: `eventType` and a millisecond `timestamp`. The priority
//! class is never stored; it is derived from the `contentIsLive` flag every
//! time it is needed.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Key holding the event type name.
pub const EVENT_TYPE_KEY: &str = "eventType";
/// Key holding the millisecond timestamp.
pub const TIMESTAMP_KEY: &str = "timestamp";
/// Boolean key that routes an event to the live class.
pub const CONTENT_IS_LIVE_KEY: &str = "contentIsLive";
/// Key used for collapsing repeated actions.
pub const ACTION_NAME_KEY: &str = "actionName";

/// Delivery priority of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    /// Time-sensitive events (live streams). Small, frequent batches.
    Live,
    /// Delay-tolerant events. Larger, less frequent batches.
    #[serde(rename = "ondemand")]
    OnDemand,
}

impl PriorityClass {
    /// Both classes, live first.
    pub const ALL: [PriorityClass; 2] = [PriorityClass::Live, PriorityClass::OnDemand];

    /// Stable string tag, used in the durable store and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Live => "live",
            PriorityClass::OnDemand => "ondemand",
        }
    }

    /// Parse a stored tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "live" => Some(PriorityClass::Live),
            "ondemand" | "on-demand" | "on_demand" => Some(PriorityClass::OnDemand),
            _ => None,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single telemetry event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Build an event from producer attributes, stamping type and timestamp.
    ///
    /// The stamped keys win over any same-named attribute.
    pub fn new(event_type: &str, attributes: Map<String, Value>, timestamp_ms: i64) -> Self {
        let mut fields = attributes;
        fields.insert(
            EVENT_TYPE_KEY.to_string(),
            Value::String(event_type.to_string()),
        );
        fields.insert(TIMESTAMP_KEY.to_string(), Value::from(timestamp_ms));
        Self(fields)
    }

    /// Wrap raw fields without stamping anything (recovered payloads).
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Parse an event from a JSON object string.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(CoreError::InvalidEvent(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Serialize to a compact JSON object string.
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// The `eventType` value, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.0.get(EVENT_TYPE_KEY).and_then(Value::as_str)
    }

    /// The millisecond `timestamp` value, if present.
    pub fn timestamp(&self) -> Option<i64> {
        self.0.get(TIMESTAMP_KEY).and_then(Value::as_i64)
    }

    /// Derived priority class. Only a literal `true` marks an event as live.
    pub fn priority_class(&self) -> PriorityClass {
        match self.0.get(CONTENT_IS_LIVE_KEY) {
            Some(Value::Bool(true)) => PriorityClass::Live,
            _ => PriorityClass::OnDemand,
        }
    }

    /// Non-blank `actionName`, if present.
    pub fn action_name(&self) -> Option<&str> {
        self.0
            .get(ACTION_NAME_KEY)
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    /// Look up a single field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow all fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the event, returning its fields.
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the event has no fields at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
