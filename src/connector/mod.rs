//! Transport bindings
//!
//! A [`Connector`] performs the actual connect / send / close against one
//! monitoring backend. Each connector is owned by exactly one
//! [`Connection`](crate::connection::Connection), which serializes every
//! call into it, so implementations never see concurrent use.
//!
//! Built-in transports:
//! - [`TcpConnector`]: newline-delimited JSON over TCP
//! - [`ChannelConnector`]: hands messages to an in-process channel

pub mod channel;
pub mod tcp;

pub use channel::{channel_factory, ChannelConnector};
pub use tcp::{TcpConnector, DEFAULT_CONNECT_TIMEOUT};

use async_trait::async_trait;

use crate::connection::ConnectionStatus;
use crate::message::OutboundMessage;

/// Errors raised by transports and by connections wrapping them
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Failed to close connection: {0}")]
    Close(String),

    #[error("Connection is not usable (status: {0})")]
    NotConnected(ConnectionStatus),

    #[error("Connection has been stopped")]
    Stopped,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport capability against one backend
#[async_trait]
pub trait Connector: Send {
    /// Short transport name used in logs
    fn name(&self) -> &str;

    /// Establish the transport connection
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Release the transport connection
    ///
    /// Best effort: callers log the error and carry on.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Deliver one message; only called while the owning connection is connected
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Creates a fresh connector for every new pooled connection
pub trait ConnectorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Connector>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Box<dyn Connector> + Send + Sync,
{
    fn create(&self) -> Box<dyn Connector> {
        self()
    }
}
