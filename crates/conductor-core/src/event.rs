use serde_json::{Map, Value};

use crate::operation::OperationStatus;

/// Snapshot event sent once per (re)connection. Authoritative: the default
/// dispatch behavior replaces the whole synchronized state with its payload,
/// because it is also the only resynchronization mechanism after a reconnect
/// gap (events emitted while disconnected are never replayed).
pub const INITIAL_STATE_EVENT: &str = "initial_state";

/// Terminal-output event: its payload is normalized to plain lines and
/// appended to the operation log.
pub const OUTPUT_EVENT: &str = "output";

/// A decoded server-pushed event. `name` is the multiplexing key; the
/// remaining fields are optional and event-specific, matching the minimum
/// wire shape `{ event, status?, progress?, message?, details?, error? }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushEvent {
    pub name: String,
    pub status: Option<OperationStatus>,
    pub progress: Option<u32>,
    pub message: Option<String>,
    pub details: Option<Value>,
    pub error: Option<String>,
    pub sequence: u64,
}

impl PushEvent {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The event's payload normalized into the shapes handlers may rely on.
    pub fn payload(&self) -> EventPayload {
        EventPayload::from_value(self.details.clone())
    }

    /// Normalize this event to plain log lines. Structured payloads
    /// contribute their `message`/`data` fields; a bare-string payload is one
    /// line; with no payload at all the top-level `message` field is used.
    pub fn log_lines(&self) -> Vec<String> {
        let lines = self.payload().lines();
        if lines.is_empty() {
            self.message.iter().cloned().collect()
        } else {
            lines
        }
    }
}

/// The same logical event arrives from the backend as a bare string, a
/// `{message: ...}` object, or a `{data: ...}` object depending on which
/// subsystem produced it. Normalizing at the dispatcher boundary keeps
/// handlers out of the shape-sniffing business.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Empty,
    Text(String),
    Structured(Map<String, Value>),
}

impl EventPayload {
    pub fn from_value(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Empty,
            Some(Value::String(text)) => Self::Text(text),
            Some(Value::Object(map)) => Self::Structured(map),
            // Arrays and scalars are rare but observed; keep them readable.
            Some(other) => Self::Text(other.to_string()),
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Structured(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Flatten the payload into human-readable log lines.
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::Text(text) => vec![text.clone()],
            Self::Structured(map) => {
                let mut lines = Vec::new();
                if let Some(Value::String(message)) = map.get("message") {
                    lines.push(message.clone());
                }
                match map.get("data") {
                    Some(Value::String(data)) => lines.push(data.clone()),
                    Some(Value::Array(items)) => {
                        for item in items {
                            match item {
                                Value::String(line) => lines.push(line.clone()),
                                other => lines.push(other.to_string()),
                            }
                        }
                    }
                    Some(other) if !other.is_null() => lines.push(other.to_string()),
                    _ => {}
                }
                lines
            }
        }
    }
}
