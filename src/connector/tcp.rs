//! Newline-delimited JSON over TCP
//!
//! Every message is written as one line: `{"headers": {...}, "message": {...}}`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use super::{Connector, TransportError};
use crate::message::OutboundMessage;

/// Connect timeout used when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP transport writing one JSON line per message
pub struct TcpConnector {
    /// `host:port` to connect to
    address: String,

    /// Connect timeout
    connect_timeout: Duration,

    /// Buffered write half, present while connected
    stream: Option<BufWriter<TcpStream>>,
}

impl TcpConnector {
    /// Create a connector for `host:port`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
        }
    }

    /// Create a connector from an endpoint such as `tcp://host:port` or `host:port`
    pub fn from_endpoint(endpoint: &str) -> Result<Self, TransportError> {
        Ok(Self::new(parse_endpoint(endpoint)?))
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The `host:port` this connector talks to
    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect_error(&self, reason: impl Into<String>) -> TransportError {
        TransportError::Connect {
            endpoint: self.address.clone(),
            reason: reason.into(),
        }
    }
}

/// Normalize an endpoint to `host:port`
pub fn parse_endpoint(endpoint: &str) -> Result<String, TransportError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(TransportError::InvalidEndpoint("empty endpoint".to_string()));
    }

    if !endpoint.contains("://") {
        return match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(endpoint.to_string()),
            _ => Err(TransportError::InvalidEndpoint(format!("expected host:port, got {endpoint}"))),
        };
    }

    let url = url::Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    if url.scheme() != "tcp" {
        return Err(TransportError::InvalidEndpoint(format!(
            "unsupported scheme '{}' in {endpoint}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing host in {endpoint}")))?;
    let port = url
        .port()
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing port in {endpoint}")))?;

    Ok(format!("{host}:{port}"))
}

#[async_trait]
impl Connector for TcpConnector {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| self.connect_error("connection timeout"))?
            .map_err(|e| self.connect_error(e.to_string()))?;

        stream.set_nodelay(true)?;
        self.stream = Some(BufWriter::new(stream));

        debug!(address = %self.address, "TCP connector connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::Close(e.to_string()))?;
        }
        Ok(())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let line = message.to_wire_line()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Send("TCP connector is not connected".to_string()))?;

        stream.write_all(&line).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }
}
