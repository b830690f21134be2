//! The operation state machine: a convention layered over channel state.
//!
//! Lifecycle: `idle -> started -> in_progress* -> (complete | failed)`, then
//! back to `idle` via explicit dismissal or a display timer. Records are keyed
//! by a stable operation id so independent tasks on one channel (three
//! certificates deleted at once, say) never overwrite each other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::dispatch::HandlerContext;
use crate::event::PushEvent;
use crate::state::SynchronizedState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Idle,
    Started,
    InProgress,
    Complete,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::InProgress)
    }
}

/// Either a percentage or a completed/total count, whichever the backend
/// reports for the task at hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    Percent(u32),
    Count { done: u32, total: u32 },
}

impl Default for Progress {
    fn default() -> Self {
        Self::Percent(0)
    }
}

impl Progress {
    pub fn percent(self) -> u32 {
        match self {
            Self::Percent(value) => value.min(100),
            Self::Count { done, total } => {
                if total == 0 {
                    100
                } else {
                    // u64 intermediate so large item counts cannot overflow
                    ((u64::from(done.min(total)) * 100) / u64::from(total)) as u32
                }
            }
        }
    }

    /// The value a terminal success event forces: 100, or done == total.
    fn completed(self) -> Self {
        match self {
            Self::Percent(_) => Self::Percent(100),
            Self::Count { total, .. } => Self::Count { done: total, total },
        }
    }
}

/// Sub-status for one item of a multi-item operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The lifecycle facet of channel state for one tracked task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub status: OperationStatus,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_item: BTreeMap<String, ItemProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationRecord {
    /// Enter `started`, clearing any detail left from a previous run.
    pub fn begin(&mut self, message: Option<String>) {
        *self = Self {
            status: OperationStatus::Started,
            message,
            ..Self::default()
        };
    }

    /// Fold a server-pushed event into the record, applying the transition
    /// rules. Progress never regresses: a lower value than the current one is
    /// ignored and the stored value kept. A terminal status is sticky: late
    /// progress and conflicting terminal events are dropped; only an explicit
    /// idle reset or an authoritative snapshot replaces it.
    pub fn apply(&mut self, event: &PushEvent) {
        match event.status {
            Some(OperationStatus::Idle) => self.reset(),
            Some(OperationStatus::Started) => self.begin(event.message.clone()),
            Some(OperationStatus::InProgress) => {
                if self.status.is_terminal() {
                    return;
                }
                // The first progress event moves an idle record to started;
                // successive ones mark it in_progress.
                self.status = if self.status == OperationStatus::Idle {
                    OperationStatus::Started
                } else {
                    OperationStatus::InProgress
                };
                if let Some(progress) = event.progress {
                    self.advance(Progress::Percent(progress));
                }
                if event.message.is_some() {
                    self.message.clone_from(&event.message);
                }
            }
            Some(OperationStatus::Complete) => {
                if self.status.is_terminal() {
                    return;
                }
                // Zero-work operations complete straight from idle; the
                // started hop is implied, not observable.
                self.status = OperationStatus::Complete;
                self.progress = self.progress.completed();
                if event.message.is_some() {
                    self.message.clone_from(&event.message);
                }
            }
            Some(OperationStatus::Failed) => {
                if self.status.is_terminal() {
                    return;
                }
                self.status = OperationStatus::Failed;
                self.error = event
                    .error
                    .clone()
                    .or_else(|| event.message.clone())
                    .or_else(|| self.error.take());
                if event.message.is_some() {
                    self.message.clone_from(&event.message);
                }
            }
            None => {
                // Statusless events carry supplementary detail only.
                if !self.status.is_active() {
                    return;
                }
                if let Some(progress) = event.progress {
                    self.advance(Progress::Percent(progress));
                }
                if event.message.is_some() {
                    self.message.clone_from(&event.message);
                }
            }
        }
    }

    /// Monotonic progress update: regressions are ignored.
    pub fn advance(&mut self, progress: Progress) {
        if progress.percent() >= self.progress.percent() {
            self.progress = progress;
        }
    }

    /// Update exactly one item's sub-entry, leaving siblings untouched.
    pub fn update_item(&mut self, id: impl Into<String>, item: ItemProgress) {
        self.per_item.insert(id.into(), item);
    }

    /// Back to idle with all detail cleared (dismissal or display timer).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// All records of one channel, keyed by stable operation id, stored under a
/// single top-level state key. Load-modify-store keeps sibling records intact
/// because the nested map is replaced wholesale inside one dispatch turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationSet {
    records: BTreeMap<String, OperationRecord>,
}

impl OperationSet {
    pub fn load(state: &SynchronizedState, key: &str) -> Self {
        match state.get(key) {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!(key, error = %e, "operation set in state is malformed; starting fresh");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn record(&self, id: &str) -> Option<&OperationRecord> {
        self.records.get(id)
    }

    pub fn record_mut(&mut self, id: impl Into<String>) -> &mut OperationRecord {
        self.records.entry(id.into()).or_default()
    }

    pub fn apply(&mut self, id: impl Into<String>, event: &PushEvent) {
        self.record_mut(id).apply(event);
    }

    pub fn remove(&mut self, id: &str) -> Option<OperationRecord> {
        self.records.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OperationRecord)> {
        self.records.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Write the set back under `key`, replacing the nested map wholesale.
    pub fn store(&self, key: &str, ctx: &mut HandlerContext<'_>) {
        ctx.update_state(json!({ key: self.to_value() }));
    }
}
