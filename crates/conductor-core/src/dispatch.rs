use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::event::{EventPayload, INITIAL_STATE_EVENT, OUTPUT_EVENT, PushEvent};
use crate::state::{OperationLog, SynchronizedState};

/// A client->server event queued for the socket transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: Option<Value>,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Upstream path of a socket channel. Stream channels have none.
pub type Emitter = mpsc::Sender<OutboundEvent>;

pub type Handler = Arc<dyn Fn(&PushEvent, &mut HandlerContext<'_>) + Send + Sync>;

/// Declarative event-name -> handler mapping, built once per channel.
///
/// Handlers run synchronously inside one dispatch turn and must not block;
/// follow-up I/O is fire-and-forget relative to the dispatch call.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&PushEvent, &mut HandlerContext<'_>) + Send + Sync + 'static,
    {
        self.handlers.insert(event.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, event: &str) -> Option<&Handler> {
        self.handlers.get(event)
    }

    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything a handler may touch during one dispatch turn. State and log are
/// owned by the channel manager; handlers see them only through this context.
pub struct HandlerContext<'a> {
    state: &'a mut SynchronizedState,
    log: &'a mut OperationLog,
    emitter: Option<&'a Emitter>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        state: &'a mut SynchronizedState,
        log: &'a mut OperationLog,
        emitter: Option<&'a Emitter>,
    ) -> Self {
        Self {
            state,
            log,
            emitter,
        }
    }

    pub fn state(&self) -> &SynchronizedState {
        self.state
    }

    /// Shallow merge, last-write-wins per top-level key.
    pub fn update_state(&mut self, partial: Value) {
        self.state.merge(partial);
    }

    /// Wholesale replacement; what the `initial_state` snapshot requires.
    pub fn replace_state(&mut self, value: Value) {
        self.state.replace(value);
    }

    pub fn log(&self) -> &OperationLog {
        self.log
    }

    pub fn append_to_log(&mut self, line: impl Into<String>) {
        self.log.append(line);
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Best-effort upstream emit. Returns false on a stream channel (no
    /// upstream path) or when the outbound queue is full; never blocks the
    /// dispatch turn.
    pub fn emit(&mut self, event: impl Into<String>, payload: Option<Value>) -> bool {
        let Some(emitter) = self.emitter else {
            trace!("emit on a channel without an upstream path; dropping");
            return false;
        };
        let outbound = OutboundEvent::new(event, payload);
        match emitter.try_send(outbound) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "outbound queue rejected emit");
                false
            }
        }
    }
}

/// Routes decoded events to their handlers.
///
/// Unknown event names are no-ops so legacy or newer servers never crash a
/// channel. Two reserved names have defaults any feature may override by
/// registering its own handler: `initial_state` replaces the state wholesale,
/// `output` appends the payload's normalized lines to the log.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    table: HandlerTable,
}

impl Dispatcher {
    pub fn new(table: HandlerTable) -> Self {
        Self { table }
    }

    pub fn dispatch(&self, event: &PushEvent, ctx: &mut HandlerContext<'_>) {
        if let Some(handler) = self.table.get(&event.name) {
            handler(event, ctx);
            return;
        }

        match event.name.as_str() {
            INITIAL_STATE_EVENT => match event.payload() {
                EventPayload::Structured(map) => ctx.replace_state(Value::Object(map)),
                other => {
                    warn!(?other, "initial_state snapshot without an object payload");
                }
            },
            OUTPUT_EVENT => {
                for line in event.log_lines() {
                    ctx.append_to_log(line);
                }
            }
            name => trace!(event = name, "no handler registered; dropping event"),
        }
    }
}
