//! Pool-facing wrapper around one connection

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionStatus};
use crate::connector::TransportError;
use crate::message::OutboundMessage;

/// A connection eligible for pooling
pub struct Connectable {
    /// Unique within its pool
    id: u64,

    connection: Arc<Connection>,

    /// Creation time
    created_at: Instant,

    /// Last time a send went through this instance
    last_used: Mutex<Instant>,

    /// Number of sends attempted through this instance
    use_count: AtomicU64,

    /// Set while a caller holds this instance
    checked_out: AtomicBool,
}

impl Connectable {
    pub(crate) fn new(id: u64, connection: Arc<Connection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            created_at: now,
            last_used: Mutex::new(now),
            use_count: AtomicU64::new(0),
            checked_out: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Whether the instance can be handed out for sending
    pub fn is_usable(&self) -> bool {
        self.connection.is_connected()
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last send
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub fn is_checked_out(&self) -> bool {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Send through the wrapped connection
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.mark_used();
        self.connection.send(message).await
    }

    fn mark_used(&self) {
        *self.last_used.lock() = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Flag the instance as held; returns false if it already was
    pub(crate) fn check_out(&self) -> bool {
        self.checked_out
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn check_in(&self) {
        self.checked_out.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Connectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connectable")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("use_count", &self.use_count())
            .field("checked_out", &self.is_checked_out())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorFactory;
    use crate::test_support::MockState;

    #[tokio::test]
    async fn test_send_resets_idle_time() {
        let state = MockState::new();
        let connection = Connection::new("idle-test", state.factory().create(), Duration::from_millis(50));
        connection.initial_connect().await;
        let connectable = Connectable::new(1, connection);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(connectable.idle_for() >= Duration::from_millis(30));

        let message = OutboundMessage::project(">a>", serde_json::json!({}));
        connectable.send(&message).await.unwrap();
        assert!(connectable.idle_for() < Duration::from_millis(30));
        assert_eq!(connectable.use_count(), 1);
        assert!(connectable.age() >= Duration::from_millis(30));

        connectable.connection().stop().await;
    }
}
