use serde_json::{Map, Value};
use tracing::warn;

/// The feature-owned object kept current by merging dispatched events.
///
/// Merges are shallow and last-write-wins per top-level key. Nested
/// structures (per-item progress maps and the like) are feature-managed:
/// handlers replace them wholesale, nothing here deep-merges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynchronizedState {
    map: Map<String, Value>,
}

impl SynchronizedState {
    pub fn new(initial: Value) -> Self {
        match initial {
            Value::Object(map) => Self { map },
            Value::Null => Self::default(),
            other => {
                warn!(?other, "initial state must be a JSON object; starting empty");
                Self::default()
            }
        }
    }

    /// Shallow merge: every top-level key of `partial` overwrites the current
    /// value for that key. Idempotent for identical input.
    pub fn merge(&mut self, partial: Value) {
        match partial {
            Value::Object(entries) => {
                for (key, value) in entries {
                    self.map.insert(key, value);
                }
            }
            Value::Null => {}
            other => warn!(?other, "ignoring non-object state merge"),
        }
    }

    /// Wholesale replacement, used for authoritative snapshots.
    pub fn replace(&mut self, value: Value) {
        *self = Self::new(value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.map.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Append-only transcript for one channel. Cleared exactly when a new
/// operation starts, never mid-operation; grows monotonically otherwise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationLog {
    lines: Vec<String>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.clone()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
