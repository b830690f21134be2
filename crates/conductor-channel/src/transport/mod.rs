//! Transport adapters: one live connection per channel.
//!
//! Both adapters surface decoded events on an mpsc receiver and report their
//! connection state through a watch channel. Transport failures never bubble
//! into feature code; they show up as status transitions while the adapter
//! recovers (or gives up) on its own.

pub mod socket;
pub mod stream;

use std::time::Duration;

use conductor_core::{Emitter, PushEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    Error,
}

/// Socket (bidirectional) adapter tuning. Defaults are the deployed
/// convention: five attempts spaced one second apart, then give up until the
/// owning feature reopens the channel.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub outbound_capacity: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            outbound_capacity: 32,
        }
    }
}

/// Stream (unidirectional) adapter tuning. One reopen is scheduled per
/// failure; the default five-second delay keeps a flapping backend from
/// exhausting connection limits.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub reopen_delay: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reopen_delay: Duration::from_secs(5),
        }
    }
}

/// Invoked on every successful (re)connection, so a feature can request a
/// fresh snapshot or re-issue interest. The server pushes `initial_state`
/// unprompted as well; the callback exists for work beyond that.
pub type ConnectCallback = std::sync::Arc<dyn Fn() + Send + Sync>;

/// What a live adapter hands to the channel manager. Dropping the handle does
/// not stop the driver; cancel `shutdown` for that.
pub struct TransportHandle {
    pub(crate) events: mpsc::Receiver<PushEvent>,
    pub(crate) emitter: Option<Emitter>,
    pub(crate) status: watch::Receiver<ConnectionStatus>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) driver: JoinHandle<()>,
}

impl TransportHandle {
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}
