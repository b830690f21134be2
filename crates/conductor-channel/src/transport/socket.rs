//! Bidirectional (socket) transport: one multiplexed Attach stream per
//! channel, with a client->server emit path.
//!
//! Emits issued before the connection is established are queued on the
//! outbound channel and flushed once the attach handshake succeeds. On an
//! unexpected disconnect the driver retries with a fixed spacing up to the
//! configured budget, resetting the budget after every successful
//! connection; when the budget is exhausted it parks in the `Error` status
//! until the owning feature reopens the channel.

use conductor_core::{OutboundEvent, PushEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::convert;
use crate::proto;
use crate::proto::channel_service_client::ChannelServiceClient;
use crate::transport::{ConnectCallback, ConnectionStatus, SocketOptions, TransportHandle};

const EVENT_BUFFER: usize = 128;

pub fn open(
    endpoint: Channel,
    channel_id: impl Into<String>,
    on_connect: Option<ConnectCallback>,
    options: SocketOptions,
) -> TransportHandle {
    let channel_id = channel_id.into();
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (emit_tx, emit_rx) = mpsc::channel(options.outbound_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
    let shutdown = CancellationToken::new();

    let driver = tokio::spawn(run_driver(Driver {
        endpoint,
        channel_id,
        on_connect,
        options,
        event_tx,
        emit_rx,
        status_tx,
        shutdown: shutdown.clone(),
    }));

    TransportHandle {
        events: event_rx,
        emitter: Some(emit_tx),
        status: status_rx,
        shutdown,
        driver,
    }
}

struct Driver {
    endpoint: Channel,
    channel_id: String,
    on_connect: Option<ConnectCallback>,
    options: SocketOptions,
    event_tx: mpsc::Sender<PushEvent>,
    emit_rx: mpsc::Receiver<OutboundEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

async fn run_driver(mut driver: Driver) {
    let mut client = ChannelServiceClient::new(driver.endpoint.clone());
    let mut attempts = 0u32;
    // an emit taken off the queue right as the connection died under it
    let mut pending: Option<OutboundEvent> = None;

    loop {
        if driver.shutdown.is_cancelled() {
            driver.status_tx.send_replace(ConnectionStatus::Closed);
            return;
        }
        driver.status_tx.send_replace(ConnectionStatus::Connecting);

        let (out_tx, out_rx) =
            mpsc::channel::<proto::AttachRequest>(driver.options.outbound_capacity.max(1));
        let outbound = tokio_stream::once(convert::subscribe_frame(&driver.channel_id))
            .chain(ReceiverStream::new(out_rx));

        let attach = tokio::select! {
            () = driver.shutdown.cancelled() => {
                driver.status_tx.send_replace(ConnectionStatus::Closed);
                return;
            }
            attach = client.attach(Request::new(outbound)) => attach,
        };

        let mut inbound = match attach {
            Ok(response) => response.into_inner(),
            Err(status) => {
                warn!(channel = %driver.channel_id, error = %status, "attach failed");
                attempts += 1;
                if attempts > driver.options.max_retries {
                    driver.status_tx.send_replace(ConnectionStatus::Error);
                    return;
                }
                if wait_before_retry(&driver, attempts).await {
                    return;
                }
                continue;
            }
        };

        attempts = 0;
        driver.status_tx.send_replace(ConnectionStatus::Open);
        info!(channel = %driver.channel_id, "socket transport connected");
        if let Some(callback) = &driver.on_connect {
            callback();
        }

        if let Some(queued) = pending.take() {
            if out_tx
                .send(convert::emit_frame(&driver.channel_id, &queued))
                .await
                .is_err()
            {
                pending = Some(queued);
            }
        }

        // connected: pump inbound events and forward queued emits
        loop {
            tokio::select! {
                () = driver.shutdown.cancelled() => {
                    driver.status_tx.send_replace(ConnectionStatus::Closed);
                    return;
                }
                queued = driver.emit_rx.recv() => match queued {
                    Some(outbound_event) => {
                        if out_tx
                            .send(convert::emit_frame(&driver.channel_id, &outbound_event))
                            .await
                            .is_err()
                        {
                            pending = Some(outbound_event);
                            break;
                        }
                    }
                    None => {
                        // every emitter is gone, the manager has shut down
                        driver.status_tx.send_replace(ConnectionStatus::Closed);
                        return;
                    }
                },
                message = inbound.message() => match message {
                    Ok(Some(server_event)) => {
                        match convert::server_event_to_push(server_event) {
                            Ok(event) => {
                                if driver.event_tx.send(event).await.is_err() {
                                    driver.status_tx.send_replace(ConnectionStatus::Closed);
                                    return;
                                }
                            }
                            Err(violation) => {
                                warn!(
                                    channel = %driver.channel_id,
                                    error = %violation,
                                    "dropping malformed event"
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(channel = %driver.channel_id, "server closed the stream");
                        break;
                    }
                    Err(status) => {
                        warn!(channel = %driver.channel_id, error = %status, "stream error");
                        break;
                    }
                },
            }
        }

        attempts += 1;
        if attempts > driver.options.max_retries {
            warn!(channel = %driver.channel_id, "retry budget exhausted; giving up");
            driver.status_tx.send_replace(ConnectionStatus::Error);
            return;
        }
        if wait_before_retry(&driver, attempts).await {
            return;
        }
    }
}

/// Fixed-interval spacing between attempts. Returns true when shut down.
async fn wait_before_retry(driver: &Driver, attempt: u32) -> bool {
    debug!(
        channel = %driver.channel_id,
        attempt,
        "reconnecting after {:?}",
        driver.options.retry_delay
    );
    tokio::select! {
        () = driver.shutdown.cancelled() => {
            driver.status_tx.send_replace(ConnectionStatus::Closed);
            true
        }
        () = sleep(driver.options.retry_delay) => false,
    }
}
