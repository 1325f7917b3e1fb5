//! Scriptable connector shared by the unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connector::{Connector, ConnectorFactory, TransportError};
use crate::message::OutboundMessage;

#[derive(Default)]
pub(crate) struct MockState {
    pub connects: AtomicUsize,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,

    /// Upcoming connect calls that fail
    pub fail_connects: AtomicUsize,

    /// Upcoming send calls that fail
    pub fail_sends: AtomicUsize,

    pub fail_closes: AtomicBool,

    /// Sends never complete while set
    pub hang_sends: AtomicBool,

    /// Upcoming send calls that panic inside the connector
    pub panic_sends: AtomicUsize,

    pub connect_delay: Mutex<Duration>,

    pub send_delay: Mutex<Duration>,

    /// Sends currently inside the connector
    pub in_flight: AtomicUsize,

    pub delivered: Mutex<Vec<OutboundMessage>>,

    /// Connectors created through `factory`
    pub created: AtomicUsize,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectorFactory> {
        let state = Arc::clone(self);
        Arc::new(move || {
            state.created.fetch_add(1, Ordering::SeqCst);
            Box::new(MockConnector::new(Arc::clone(&state))) as Box<dyn Connector>
        })
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Wait until at least `n` sends are inside the connector
    pub async fn wait_in_flight(&self, n: usize) {
        for _ in 0..400 {
            if self.in_flight.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {n} sends in flight, saw {}",
            self.in_flight.load(Ordering::SeqCst)
        );
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub(crate) struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.state.fail_connects) {
            return Err(TransportError::Connect {
                endpoint: "mock".to_string(),
                reason: "refused".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_closes.load(Ordering::SeqCst) {
            return Err(TransportError::Close("close failed".to_string()));
        }
        Ok(())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&self.state.in_flight);

        if take_one(&self.state.panic_sends) {
            panic!("connector blew up on {message}");
        }

        if self.state.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let delay = *self.state.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.state.fail_sends) {
            return Err(TransportError::Send("broken pipe".to_string()));
        }

        self.state.delivered.lock().push(message.clone());
        Ok(())
    }
}
