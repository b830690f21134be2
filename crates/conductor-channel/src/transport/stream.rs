//! Unidirectional (stream) transport: server->client push only.
//!
//! There is no emit path; operations on a stream channel are started over
//! plain HTTP before (or while) subscribing. On any failure the driver tears
//! the connection down and schedules exactly one reopen after a fixed delay,
//! never a tight retry loop.

use conductor_core::PushEvent;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::convert;
use crate::proto;
use crate::proto::channel_service_client::ChannelServiceClient;
use crate::transport::{ConnectionStatus, StreamOptions, TransportHandle};

const EVENT_BUFFER: usize = 128;

pub fn open(
    endpoint: Channel,
    channel_id: impl Into<String>,
    options: StreamOptions,
) -> TransportHandle {
    let channel_id = channel_id.into();
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
    let shutdown = CancellationToken::new();

    let driver = tokio::spawn(run_driver(
        endpoint,
        channel_id,
        options,
        event_tx,
        status_tx,
        shutdown.clone(),
    ));

    TransportHandle {
        events: event_rx,
        emitter: None,
        status: status_rx,
        shutdown,
        driver,
    }
}

async fn run_driver(
    endpoint: Channel,
    channel_id: String,
    options: StreamOptions,
    event_tx: mpsc::Sender<PushEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
) {
    let mut client = ChannelServiceClient::new(endpoint);

    loop {
        if shutdown.is_cancelled() {
            status_tx.send_replace(ConnectionStatus::Closed);
            return;
        }
        status_tx.send_replace(ConnectionStatus::Connecting);

        let request = proto::SubscribeRequest {
            channel_id: channel_id.clone(),
        };
        let subscribed = tokio::select! {
            () = shutdown.cancelled() => {
                status_tx.send_replace(ConnectionStatus::Closed);
                return;
            }
            subscribed = client.subscribe(request) => subscribed,
        };

        match subscribed {
            Ok(response) => {
                let mut inbound = response.into_inner();
                status_tx.send_replace(ConnectionStatus::Open);
                info!(channel = %channel_id, "stream transport connected");

                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => {
                            status_tx.send_replace(ConnectionStatus::Closed);
                            return;
                        }
                        message = inbound.message() => match message {
                            Ok(Some(server_event)) => {
                                match convert::server_event_to_push(server_event) {
                                    Ok(event) => {
                                        if event_tx.send(event).await.is_err() {
                                            status_tx.send_replace(ConnectionStatus::Closed);
                                            return;
                                        }
                                    }
                                    Err(violation) => {
                                        warn!(
                                            channel = %channel_id,
                                            error = %violation,
                                            "dropping malformed event"
                                        );
                                    }
                                }
                            }
                            Ok(None) => {
                                debug!(channel = %channel_id, "server closed the stream");
                                break;
                            }
                            Err(status) => {
                                warn!(channel = %channel_id, error = %status, "stream error");
                                break;
                            }
                        },
                    }
                }
            }
            Err(status) => {
                warn!(channel = %channel_id, error = %status, "subscribe failed");
            }
        }

        // one reopen per failure, after the fixed delay
        debug!(channel = %channel_id, "reopening in {:?}", options.reopen_delay);
        tokio::select! {
            () = shutdown.cancelled() => {
                status_tx.send_replace(ConnectionStatus::Closed);
                return;
            }
            () = sleep(options.reopen_delay) => {}
        }
    }
}
