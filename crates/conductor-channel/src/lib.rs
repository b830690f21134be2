pub mod channel;
pub mod convert;
pub mod error;
pub mod local;
pub mod transport;

pub use channel::{ChannelConfig, ChannelId, ChannelManager, TransportKind, connect_endpoint};
pub use error::ChannelError;
pub use transport::{ConnectionStatus, SocketOptions, StreamOptions};

pub use conductor_proto::channel::v1 as proto;
