//! Channel manager: the lifecycle glue a feature instantiates once per
//! channel id.
//!
//! Each manager owns exactly one live transport, the merged synchronized
//! state, and the operation log. Managers are not deduplicated: two managers
//! created for the same channel id from different features own two
//! independent connections, and teardown is tied to the owning feature's own
//! lifecycle rather than any process-wide registry.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::{
    Dispatcher, Emitter, HandlerContext, HandlerTable, OperationLog, OperationSet, OutboundEvent,
    SynchronizedState,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::error::ChannelError;
use crate::transport::{
    self, ConnectCallback, ConnectionStatus, SocketOptions, StreamOptions, TransportHandle,
};

/// Key of one logical push source ("certificate operations", "server
/// install", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    Stream,
}

pub struct ChannelConfig {
    pub initial_state: Value,
    pub handlers: HandlerTable,
    pub transport: TransportKind,
    pub socket: SocketOptions,
    pub stream: StreamOptions,
    pub on_connect: Option<ConnectCallback>,
}

impl ChannelConfig {
    pub fn socket() -> Self {
        Self::with_kind(TransportKind::Socket)
    }

    pub fn stream() -> Self {
        Self::with_kind(TransportKind::Stream)
    }

    fn with_kind(transport: TransportKind) -> Self {
        Self {
            initial_state: Value::Null,
            handlers: HandlerTable::new(),
            transport,
            socket: SocketOptions::default(),
            stream: StreamOptions::default(),
            on_connect: None,
        }
    }

    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    pub fn handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn on_connect(mut self, callback: ConnectCallback) -> Self {
        self.on_connect = Some(callback);
        self
    }
}

struct Owned {
    state: SynchronizedState,
    log: OperationLog,
}

pub struct ChannelManager {
    id: ChannelId,
    shared: Arc<Mutex<Owned>>,
    emitter: Option<Emitter>,
    status: watch::Receiver<ConnectionStatus>,
    revision: Arc<watch::Sender<u64>>,
    changes: watch::Receiver<u64>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Resolve and connect a lazy endpoint for the channel transports.
pub async fn connect_endpoint(addr: &str) -> Result<Channel, ChannelError> {
    let endpoint = Endpoint::try_from(addr.to_string())?.tcp_nodelay(true);
    Ok(endpoint.connect().await?)
}

impl ChannelManager {
    /// Open the configured transport and start dispatching its events into
    /// this manager's state and log.
    pub fn create(endpoint: Channel, id: impl Into<ChannelId>, config: ChannelConfig) -> Self {
        let id = id.into();
        let handle = match config.transport {
            TransportKind::Socket => transport::socket::open(
                endpoint,
                id.as_str(),
                config.on_connect.clone(),
                config.socket.clone(),
            ),
            TransportKind::Stream => {
                transport::stream::open(endpoint, id.as_str(), config.stream.clone())
            }
        };
        let TransportHandle {
            mut events,
            emitter,
            status,
            shutdown,
            driver,
        } = handle;

        let shared = Arc::new(Mutex::new(Owned {
            state: SynchronizedState::new(config.initial_state),
            log: OperationLog::new(),
        }));
        let (revision_tx, changes) = watch::channel(0u64);
        let revision = Arc::new(revision_tx);

        let dispatcher = Dispatcher::new(config.handlers);
        let dispatch_shared = shared.clone();
        let dispatch_emitter = emitter.clone();
        let dispatch_revision = revision.clone();
        let dispatch_id = id.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                {
                    let mut owned = dispatch_shared.lock().await;
                    let Owned { state, log } = &mut *owned;
                    let mut ctx = HandlerContext::new(state, log, dispatch_emitter.as_ref());
                    dispatcher.dispatch(&event, &mut ctx);
                }
                dispatch_revision.send_modify(|revision| *revision += 1);
            }
            debug!(channel = %dispatch_id, "dispatch loop ended");
        });

        Self {
            id,
            shared,
            emitter,
            status,
            revision,
            changes,
            shutdown,
            tasks: std::sync::Mutex::new(vec![driver, dispatch_task]),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// A snapshot of the synchronized state.
    pub async fn state(&self) -> Value {
        self.shared.lock().await.state.snapshot()
    }

    /// Shallow merge into the synchronized state, outside any dispatch turn.
    pub async fn update_state(&self, partial: Value) {
        self.shared.lock().await.state.merge(partial);
        self.revision.send_modify(|revision| *revision += 1);
    }

    pub async fn log(&self) -> Vec<String> {
        self.shared.lock().await.log.snapshot()
    }

    pub async fn append_to_log(&self, line: impl Into<String>) {
        self.shared.lock().await.log.append(line);
        self.revision.send_modify(|revision| *revision += 1);
    }

    pub async fn clear_log(&self) {
        self.shared.lock().await.log.clear();
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Queue a client->server event. Fails on stream channels (no upstream
    /// path), when the outbound queue is full, or after shutdown; queued
    /// emits survive a reconnect and are flushed once the socket is back.
    pub fn emit(
        &self,
        event: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), ChannelError> {
        let Some(emitter) = &self.emitter else {
            return Err(ChannelError::NoUpstream);
        };
        emitter
            .try_send(OutboundEvent::new(event, payload))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Bumped on every state or log mutation; render loops and tests await
    /// it instead of polling.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Dismiss a tracked operation: back to idle, detail cleared.
    pub async fn reset_operation(&self, key: &str, operation_id: &str) {
        let mut owned = self.shared.lock().await;
        let mut set = OperationSet::load(&owned.state, key);
        set.record_mut(operation_id).reset();
        owned.state.merge(json!({ key: set.to_value() }));
        drop(owned);
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Auto-reset for lightweight operations: dismiss after a display delay.
    /// Destructive multi-step flows skip this and require explicit dismissal.
    pub fn reset_operation_after(&self, key: &str, operation_id: &str, delay: Duration) {
        let shared = self.shared.clone();
        let revision = self.revision.clone();
        let shutdown = self.shutdown.clone();
        let key = key.to_string();
        let operation_id = operation_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let mut owned = shared.lock().await;
                    let mut set = OperationSet::load(&owned.state, &key);
                    set.record_mut(operation_id.as_str()).reset();
                    owned.state.merge(json!({ key: set.to_value() }));
                    drop(owned);
                    revision.send_modify(|revision| *revision += 1);
                }
            }
        });
    }

    /// Tear down the transport and dispatch loop. Safe to call more than
    /// once; the connection is closed exactly once.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!(channel = %self.id, "channel shut down");
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
