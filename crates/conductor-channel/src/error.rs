use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to channel endpoint: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("this channel has no upstream path (stream transport)")]
    NoUpstream,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("channel is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
