//! In-process channel hub: a real `ChannelService` served over a localhost
//! listener.
//!
//! Integration tests (and demos) drive it directly: push events, rewrite the
//! authoritative snapshot served as `initial_state`, observe client emits,
//! and kick live connections to exercise the reconnect paths.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use conductor_core::{INITIAL_STATE_EVENT, OutboundEvent, PushEvent};
use futures::Stream;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error};

use crate::convert;
use crate::error::ChannelError;
use crate::proto;
use crate::proto::channel_service_server::{ChannelService, ChannelServiceServer};

const FRAME_BUFFER: usize = 256;

#[derive(Clone)]
enum Frame {
    Event(proto::ServerEvent),
    Kick,
}

struct HubChannel {
    snapshot: Value,
    sequence: u64,
    frames: broadcast::Sender<Frame>,
}

impl Default for HubChannel {
    fn default() -> Self {
        Self {
            snapshot: Value::Object(Map::new()),
            sequence: 0,
            frames: broadcast::channel(FRAME_BUFFER).0,
        }
    }
}

/// Shared server-side state, one entry per channel id.
#[derive(Clone)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, HubChannel>>>,
    inbound_tx: mpsc::Sender<(String, OutboundEvent)>,
}

impl ChannelHub {
    fn new(inbound_tx: mpsc::Sender<(String, OutboundEvent)>) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            inbound_tx,
        }
    }

    /// Broadcast an event to every live connection of `channel_id`.
    pub async fn push(&self, channel_id: &str, event: &PushEvent) {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(channel_id.to_string()).or_default();
        entry.sequence += 1;
        let wire = convert::push_to_server_event(event, entry.sequence);
        // no live subscribers is fine
        let _ = entry.frames.send(Frame::Event(wire));
    }

    /// Replace the authoritative snapshot served as `initial_state` on every
    /// subsequent (re)connection.
    pub async fn set_snapshot(&self, channel_id: &str, snapshot: Value) {
        let mut channels = self.channels.lock().await;
        channels.entry(channel_id.to_string()).or_default().snapshot = snapshot;
    }

    /// Drop every live connection of `channel_id` with a transport error.
    pub async fn kick(&self, channel_id: &str) {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(channel_id.to_string()).or_default();
        let _ = entry.frames.send(Frame::Kick);
    }

    async fn open_stream(&self, channel_id: &str) -> EventStream {
        let (snapshot_event, mut frames) = {
            let mut channels = self.channels.lock().await;
            let entry = channels.entry(channel_id.to_string()).or_default();
            entry.sequence += 1;
            let snapshot_event = proto::ServerEvent {
                event: INITIAL_STATE_EVENT.to_string(),
                details_json: Some(entry.snapshot.to_string()),
                sequence_num: entry.sequence,
                ..Default::default()
            };
            (snapshot_event, entry.frames.subscribe())
        };

        let stream = async_stream::stream! {
            yield Ok(snapshot_event);
            loop {
                match frames.recv().await {
                    Ok(Frame::Event(event)) => yield Ok(event),
                    Ok(Frame::Kick) => {
                        yield Err(Status::unavailable("connection dropped by hub"));
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "hub subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<proto::ServerEvent, Status>> + Send>>;

struct HubService {
    hub: ChannelHub,
}

#[tonic::async_trait]
impl ChannelService for HubService {
    type AttachStream = EventStream;
    type SubscribeStream = EventStream;

    async fn attach(
        &self,
        request: Request<Streaming<proto::AttachRequest>>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty attach stream"))?;
        let channel_id = match first.message {
            Some(proto::attach_request::Message::Subscribe(subscribe)) => subscribe.channel_id,
            _ => {
                return Err(Status::invalid_argument(
                    "attach must begin with a subscribe handshake",
                ));
            }
        };

        // forward emit frames to the inbound sink for the hub's owner
        let inbound_tx = self.hub.inbound_tx.clone();
        let emit_channel = channel_id.clone();
        tokio::spawn(async move {
            while let Ok(Some(frame)) = inbound.message().await {
                if let Some(proto::attach_request::Message::Emit(emit)) = frame.message {
                    let payload = emit
                        .payload_json
                        .as_deref()
                        .and_then(|raw| serde_json::from_str(raw).ok());
                    let outbound = OutboundEvent::new(emit.event, payload);
                    if inbound_tx.send((emit_channel.clone(), outbound)).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Response::new(self.hub.open_stream(&channel_id).await))
    }

    async fn subscribe(
        &self,
        request: Request<proto::SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let channel_id = request.into_inner().channel_id;
        Ok(Response::new(self.hub.open_stream(&channel_id).await))
    }
}

pub struct LocalChannelServer {
    pub channel: Channel,
    pub hub: ChannelHub,
    /// Client emits, as `(channel_id, event)` pairs.
    pub inbound: mpsc::Receiver<(String, OutboundEvent)>,
    pub server_handle: JoinHandle<()>,
}

/// Spin up a hub on a localhost listener and return a connected client
/// channel for it.
pub async fn serve_local_hub() -> Result<LocalChannelServer, ChannelError> {
    let (inbound_tx, inbound) = mpsc::channel(64);
    let hub = ChannelHub::new(inbound_tx);
    let service = ChannelServiceServer::new(HubService { hub: hub.clone() });

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let local_addr = listener.local_addr()?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
        {
            error!(error = %e, "local channel server exited");
        }
    });

    let endpoint = Endpoint::try_from(format!("http://{local_addr}"))?.tcp_nodelay(true);
    let channel = endpoint.connect().await?;

    Ok(LocalChannelServer {
        channel,
        hub,
        inbound,
        server_handle,
    })
}
