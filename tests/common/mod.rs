//! Test backend whose availability can be switched at runtime

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use njams_sender::connector::{Connector, ConnectorFactory, TransportError};
use njams_sender::OutboundMessage;
use parking_lot::Mutex;

#[derive(Default)]
pub struct Backend {
    /// Connects and sends fail while false
    pub up: AtomicBool,
    pub connects: AtomicUsize,
    pub received: Mutex<Vec<OutboundMessage>>,
}

impl Backend {
    pub fn new(up: bool) -> Arc<Self> {
        let backend = Self::default();
        backend.up.store(up, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectorFactory> {
        let backend = Arc::clone(self);
        Arc::new(move || {
            Box::new(BackendConnector {
                backend: Arc::clone(&backend),
                connected: false,
            }) as Box<dyn Connector>
        })
    }
}

struct BackendConnector {
    backend: Arc<Backend>,
    connected: bool,
}

#[async_trait]
impl Connector for BackendConnector {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        if !self.backend.up.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                endpoint: "switchable".to_string(),
                reason: "backend down".to_string(),
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
        if !self.connected || !self.backend.up.load(Ordering::SeqCst) {
            self.connected = false;
            return Err(TransportError::Send("connection reset by peer".to_string()));
        }
        self.backend.received.lock().push(message.clone());
        Ok(())
    }
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
