/// Errors that can occur while setting up channels and event loops.
///
/// Once a channel exists, failures never surface as errors: they become
/// connection state transitions and `Disconnected*` events.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The address cannot be used with the selected transport.
    #[error("invalid channel address: {0}")]
    Address(#[source] ipcloop_transport::TransportError),

    /// The channel configuration is unusable.
    #[error("invalid channel configuration: {0}")]
    Config(&'static str),

    /// The event loop thread or its wake primitive could not be created.
    #[error("event loop setup failed: {0}")]
    EventLoop(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
