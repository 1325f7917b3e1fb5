//! In-process transport backed by a Tokio channel

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, ConnectorFactory, TransportError};
use crate::message::OutboundMessage;

/// Delivers messages into an `mpsc` channel
///
/// Useful when the host application consumes monitoring events itself, and
/// for tests. A full channel makes `send` wait, like a slow backend would.
pub struct ChannelConnector {
    tx: mpsc::Sender<OutboundMessage>,
    connected: bool,
}

impl ChannelConnector {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx, connected: false }
    }

    /// Create a connector together with the receiving end
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

/// Factory producing channel connectors that all feed the same receiver
pub fn channel_factory(tx: mpsc::Sender<OutboundMessage>) -> impl ConnectorFactory {
    move || Box::new(ChannelConnector::new(tx.clone())) as Box<dyn Connector>
}

#[async_trait]
impl Connector for ChannelConnector {
    fn name(&self) -> &str {
        "channel"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.tx.is_closed() {
            return Err(TransportError::Connect {
                endpoint: "channel".to_string(),
                reason: "receiver has been dropped".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Send("channel connector is closed".to_string()));
        }
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| TransportError::Send("receiver has been dropped".to_string()))
    }
}
