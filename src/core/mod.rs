use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{SenderConfig, TransportKind};
use crate::connector::{channel_factory, Connector, ConnectorFactory, TcpConnector};
use crate::message::OutboundMessage;
use crate::pool::{ConnectablePool, PoolStats};
use crate::sender::{Dispatcher, DispatcherStats};

/// Combined counters of the dispatcher and its pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub dispatcher: DispatcherStats,
    pub pool: PoolStats,
}

/// Sender assembled from one configuration
///
/// Clones share the same dispatcher and pool, so any clone can send and any
/// clone can stop the whole sender.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<SenderConfig>,
    pub pool: Arc<ConnectablePool>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Core {
    /// Build the pool and dispatcher around `factory`
    ///
    /// Must be called from within a Tokio runtime; the minimum workers start
    /// right away.
    pub fn new(config: SenderConfig, factory: Arc<dyn ConnectorFactory>) -> Result<Self> {
        config.validate().context("Invalid sender configuration")?;
        let config = Arc::new(config);

        let pool = Arc::new(ConnectablePool::new(config.pool_config(), factory));
        let dispatcher = Arc::new(
            Dispatcher::new(config.dispatcher_config(), Arc::clone(&pool))
                .context("Failed to start dispatcher")?,
        );

        tracing::info!(
            transport = %config.transport,
            min_workers = config.min_queue_length,
            max_workers = config.max_queue_length,
            max_connections = config.max_connections(),
            "Sender ready"
        );

        Ok(Self {
            config,
            pool,
            dispatcher,
        })
    }

    /// Build a sender using the transport named in the configuration
    ///
    /// The channel transport has no endpoint to dial; use [`Core::with_channel`]
    /// to obtain its receiving end.
    pub fn from_config(config: SenderConfig) -> Result<Self> {
        match config.transport {
            TransportKind::Tcp => {
                let address = TcpConnector::from_endpoint(&config.endpoint)
                    .with_context(|| format!("Invalid endpoint '{}'", config.endpoint))?
                    .address()
                    .to_string();
                let factory = move || Box::new(TcpConnector::new(address.clone())) as Box<dyn Connector>;
                Self::new(config, Arc::new(factory))
            }
            TransportKind::Channel => {
                anyhow::bail!("The channel transport needs a receiver, use Core::with_channel")
            }
        }
    }

    /// Build a sender delivering into an in-process channel
    pub fn with_channel(config: SenderConfig, buffer: usize) -> Result<(Self, mpsc::Receiver<OutboundMessage>)> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let core = Self::new(config, Arc::new(channel_factory(tx)))?;
        Ok((core, rx))
    }

    /// Queue a message; never blocks and never fails
    pub fn send(&self, message: OutboundMessage) {
        self.dispatcher.send(message);
    }

    /// Stop the dispatcher and release every pooled connection
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            dispatcher: self.dispatcher.stats(),
            pool: self.pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_channel_core_delivers_and_stops() {
        let config = SenderConfig {
            transport: TransportKind::Channel,
            max_queue_length: 4,
            ..Default::default()
        };
        let (core, mut rx) = Core::with_channel(config, 16).unwrap();

        core.send(OutboundMessage::log(">app>job>", "log-1", json!({ "status": "ok" })));
        core.send(OutboundMessage::project(">app>", json!({ "model": [] })));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let mut types = vec![first.kind.message_type(), second.kind.message_type()];
        types.sort();
        assert_eq!(types, vec!["event", "project"]);

        core.stop().await;
        let stats = core.stats();
        assert_eq!(stats.dispatcher.sent, 2);
        assert_eq!(stats.pool.live, 0);
    }

    #[tokio::test]
    async fn test_from_config_rejects_channel_transport() {
        let config = SenderConfig {
            transport: TransportKind::Channel,
            ..Default::default()
        };
        assert!(Core::from_config(config).is_err());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = SenderConfig {
            min_queue_length: 3,
            max_queue_length: 1,
            transport: TransportKind::Channel,
            ..Default::default()
        };
        assert!(Core::with_channel(config, 4).is_err());
    }

    #[tokio::test]
    async fn test_tcp_core_builds_without_connecting() {
        let config = SenderConfig {
            endpoint: "tcp://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let core = Core::from_config(config).unwrap();

        // Connections are created lazily on first send
        assert_eq!(core.stats().pool.total_created, 0);
        core.stop().await;
    }
}
