//! Bounded pool of connectables
//!
//! The pool bounds how many transport connections are alive and makes them
//! safe to share between concurrent dispatch workers:
//! - instances are created lazily, up to `max_connections`
//! - a checked-out instance is held by exactly one caller
//! - broken instances (`Error` / `Stopped`) are discarded instead of reused
//! - every membership change happens under one lock
//! - a checked-out instance always finds its way back, even when its holder
//!   is cancelled or panics without calling `release`

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Span};

use super::connectable::Connectable;
use crate::connection::{Connection, ConnectionStatus};
use crate::connector::ConnectorFactory;

/// How often a waiting `acquire` re-checks the idle set on its own
///
/// Idle instances that finish reconnecting do not signal the pool.
const RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool is exhausted: no connectable became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Unable to connect a new connectable (status: {0})")]
    Unavailable(ConnectionStatus),

    #[error("Pool has been closed")]
    PoolClosed,
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connectables
    pub max_connections: usize,

    /// How long `acquire` waits for a connectable when the pool is full
    pub acquire_timeout: Duration,

    /// Retry interval handed to every connection's reconnector
    pub reconnect_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

/// Statistics for the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total connectables created
    pub total_created: u64,

    /// Total times an idle connectable was handed out again
    pub total_reused: u64,

    /// Total connectables thrown away
    pub total_discarded: u64,

    /// Total `acquire` calls that timed out
    pub total_exhausted: u64,

    /// Connectables currently alive
    pub live: usize,

    /// Alive and waiting in the idle set
    pub idle: usize,

    /// Alive and held by a caller
    pub checked_out: usize,
}

/// A connectable held by one caller
///
/// Hand it back with [`ConnectablePool::release`]. Dropping it instead
/// returns it as well: a connected instance goes back to the idle set, any
/// other is discarded and its connection stopped in the background.
pub struct PooledConnectable {
    connectable: Arc<Connectable>,
    pool: Arc<PoolShared>,

    /// Set once the instance has been given back
    returned: bool,
}

impl PooledConnectable {
    fn new(connectable: Arc<Connectable>, pool: Arc<PoolShared>) -> Self {
        Self {
            connectable,
            pool,
            returned: false,
        }
    }

    /// Take the instance out of the guard; the caller gives it back
    fn take(mut self) -> Arc<Connectable> {
        self.returned = true;
        Arc::clone(&self.connectable)
    }
}

impl Deref for PooledConnectable {
    type Target = Connectable;

    fn deref(&self) -> &Connectable {
        &self.connectable
    }
}

impl Drop for PooledConnectable {
    fn drop(&mut self) {
        if self.returned {
            return;
        }

        // Abandoned mid-use or mid-connect: only a connected instance is kept
        let status = self.connectable.status();
        if !self.pool.give_back(&self.connectable, status == ConnectionStatus::Connected) {
            debug!(
                parent: &self.pool.span,
                id = self.connectable.id(),
                status = %status,
                "Discarding abandoned connectable"
            );
            stop_detached(Arc::clone(&self.connectable));
        }
    }
}

impl fmt::Debug for PooledConnectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnectable").field(&self.connectable).finish()
    }
}

/// Stop a discarded connection without awaiting it
fn stop_detached(connectable: Arc<Connectable>) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { connectable.connection().stop().await });
        }
        Err(_) => connectable.connection().reconnector().stop_reconnecting(),
    }
}

struct PoolState {
    /// Every connectable alive, idle or checked out
    live: HashMap<u64, Arc<Connectable>>,

    /// Connectables waiting to be handed out
    idle: VecDeque<Arc<Connectable>>,

    /// Set by `expire_all`
    closed: bool,

    next_id: u64,

    total_created: u64,
    total_reused: u64,
    total_discarded: u64,
    total_exhausted: u64,
}

/// The part of the pool every checked-out instance points back to
struct PoolShared {
    state: Mutex<PoolState>,

    /// Signalled whenever a slot or an instance frees up
    released: Notify,

    span: Span,
}

impl PoolShared {
    /// Check an instance back in; returns false when it was discarded
    ///
    /// The caller stops the connection of a discarded instance.
    fn give_back(&self, connectable: &Arc<Connectable>, reusable: bool) -> bool {
        connectable.check_in();

        let kept = {
            let mut state = self.state.lock();
            let member = state.live.contains_key(&connectable.id());

            if member && !state.closed && reusable {
                state.idle.push_back(Arc::clone(connectable));
                true
            } else {
                if member {
                    state.live.remove(&connectable.id());
                    state.total_discarded += 1;
                }
                false
            }
        };

        self.released.notify_one();
        kept
    }
}

enum Checkout {
    Ready(PooledConnectable),
    Create(PooledConnectable),
    Wait,
    Closed,
}

/// Bounded pool handing out connected connectables
pub struct ConnectablePool {
    shared: Arc<PoolShared>,

    factory: Arc<dyn ConnectorFactory>,

    config: PoolConfig,
}

impl ConnectablePool {
    /// Create an empty pool; connectables are created on first use
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectorFactory>) -> Self {
        let span = info_span!("pool", max_connections = config.max_connections);
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    live: HashMap::with_capacity(config.max_connections),
                    idle: VecDeque::with_capacity(config.max_connections),
                    closed: false,
                    next_id: 0,
                    total_created: 0,
                    total_reused: 0,
                    total_discarded: 0,
                    total_exhausted: 0,
                }),
                released: Notify::new(),
                span,
            }),
            factory,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a connected connectable
    ///
    /// Reuses an idle instance when one is connected, otherwise creates and
    /// connects a new one while below capacity. At capacity, waits up to the
    /// acquire timeout for a release. Cancelling the call at any point leaves
    /// the pool as if it had never been made.
    pub async fn acquire(&self) -> Result<PooledConnectable, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let released = self.shared.released.notified();
            let (checkout, discarded) = self.checkout();
            Self::stop_all(discarded).await;

            match checkout {
                Checkout::Ready(pooled) => {
                    debug!(
                        parent: &self.shared.span,
                        id = pooled.id(),
                        use_count = pooled.use_count(),
                        idle_ms = pooled.idle_for().as_millis() as u64,
                        age_secs = pooled.age().as_secs(),
                        "Reusing connectable"
                    );
                    return Ok(pooled);
                }
                Checkout::Create(pooled) => return self.connect_new(pooled).await,
                Checkout::Closed => return Err(PoolError::PoolClosed),
                Checkout::Wait => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.shared.state.lock().total_exhausted += 1;
                warn!(
                    parent: &self.shared.span,
                    timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                    "Pool exhausted"
                );
                return Err(PoolError::PoolExhausted(self.config.acquire_timeout));
            }

            let _ = tokio::time::timeout(remaining.min(RECHECK_INTERVAL), released).await;
        }
    }

    /// Hand a connectable back
    ///
    /// Broken instances, and any instance returned after `expire_all`, are
    /// discarded and their connection stopped.
    pub async fn release(&self, pooled: PooledConnectable) {
        let connectable = pooled.take();
        let status = connectable.status();

        if !self.shared.give_back(&connectable, !status.is_broken()) {
            debug!(parent: &self.shared.span, id = connectable.id(), status = %status, "Discarding connectable");
            connectable.connection().stop().await;
        }
    }

    /// Stop and discard every connectable, idle or checked out, and close the pool
    pub async fn expire_all(&self) {
        let expired: Vec<Arc<Connectable>> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.idle.clear();
            let expired: Vec<_> = state.live.drain().map(|(_, connectable)| connectable).collect();
            state.total_discarded += expired.len() as u64;
            expired
        };

        self.shared.released.notify_waiters();

        info!(parent: &self.shared.span, count = expired.len(), "Expiring all connectables");
        Self::stop_all(expired).await;
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_discarded: state.total_discarded,
            total_exhausted: state.total_exhausted,
            live: state.live.len(),
            idle: state.idle.len(),
            checked_out: state.live.len().saturating_sub(state.idle.len()),
        }
    }

    /// Number of connectables currently alive
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Pick or reserve a connectable; all membership decisions happen here
    fn checkout(&self) -> (Checkout, Vec<Arc<Connectable>>) {
        let mut state = self.shared.state.lock();
        let mut discarded = Vec::new();

        if state.closed {
            return (Checkout::Closed, discarded);
        }

        let mut ready = None;
        let mut index = 0;
        while index < state.idle.len() {
            let status = state.idle[index].status();
            if status == ConnectionStatus::Connected {
                ready = state.idle.remove(index);
                break;
            }
            if status.is_broken() {
                if let Some(broken) = state.idle.remove(index) {
                    state.live.remove(&broken.id());
                    state.total_discarded += 1;
                    discarded.push(broken);
                }
                continue;
            }
            // Still recovering
            index += 1;
        }

        if let Some(connectable) = ready {
            let exclusive = connectable.check_out();
            debug_assert!(exclusive, "idle connectable was already checked out");
            state.total_reused += 1;
            let pooled = PooledConnectable::new(connectable, Arc::clone(&self.shared));
            return (Checkout::Ready(pooled), discarded);
        }

        if state.live.len() < self.config.max_connections {
            state.next_id += 1;
            let id = state.next_id;
            let connection = Connection::new(
                format!("connectable-{id}"),
                self.factory.create(),
                self.config.reconnect_interval,
            );
            let connectable = Arc::new(Connectable::new(id, connection));
            connectable.check_out();

            state.live.insert(id, Arc::clone(&connectable));
            state.total_created += 1;
            let pooled = PooledConnectable::new(connectable, Arc::clone(&self.shared));
            return (Checkout::Create(pooled), discarded);
        }

        (Checkout::Wait, discarded)
    }

    /// Connect a freshly reserved instance
    ///
    /// The reservation is held by `pooled`, so a cancelled connect gives the
    /// slot back through its drop.
    async fn connect_new(&self, pooled: PooledConnectable) -> Result<PooledConnectable, PoolError> {
        pooled.connection().initial_connect().await;

        if pooled.is_usable() {
            info!(
                parent: &self.shared.span,
                id = pooled.id(),
                live = self.live_count(),
                "Created new connectable"
            );
            return Ok(pooled);
        }

        let connectable = pooled.take();
        let status = connectable.status();
        self.shared.give_back(&connectable, false);
        connectable.connection().stop().await;

        Err(PoolError::Unavailable(status))
    }

    async fn stop_all(connectables: Vec<Arc<Connectable>>) {
        if connectables.is_empty() {
            return;
        }

        let mut stops = JoinSet::new();
        for connectable in connectables {
            stops.spawn(async move { connectable.connection().stop().await });
        }
        while stops.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TransportError;
    use crate::test_support::MockState;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn pool(state: &Arc<MockState>, max_connections: usize, acquire_timeout: Duration) -> Arc<ConnectablePool> {
        let config = PoolConfig {
            max_connections,
            acquire_timeout,
            reconnect_interval: Duration::from_millis(200),
        };
        Arc::new(ConnectablePool::new(config, state.factory()))
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let state = MockState::new();
        let pool = pool(&state, 2, Duration::from_secs(1));
        assert_eq!(pool.live_count(), 0);

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        assert!(first.is_usable());
        assert!(first.is_checked_out());
        pool.release(first).await;

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        pool.release(again).await;

        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(state.created.load(Ordering::SeqCst), 1);
        assert_eq!(stats.total_reused, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.checked_out, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_respects_bound_and_exclusivity() {
        let state = MockState::new();
        let pool = pool(&state, 3, Duration::from_secs(5));
        let holders = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let holders = Arc::clone(&holders);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                for _ in 0..5 {
                    let pooled = pool.acquire().await.unwrap();
                    assert!(holders.lock().insert(pooled.id()), "connectable held twice");
                    peak.fetch_max(pool.live_count(), Ordering::SeqCst);

                    tokio::time::sleep(Duration::from_millis(2)).await;

                    holders.lock().remove(&pooled.id());
                    pool.release(pooled).await;
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats().total_created <= 3);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let state = MockState::new();
        let pool = pool(&state, 1, Duration::from_millis(60));

        let held = pool.acquire().await.unwrap();
        let started = Instant::now();
        let result = pool.acquire().await;

        assert!(matches!(result, Err(PoolError::PoolExhausted(_))));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(pool.stats().total_exhausted, 1);
        assert_eq!(pool.live_count(), 1);

        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_released_instance() {
        let state = MockState::new();
        let pool = pool(&state, 1, Duration::from_secs(2));

        let held = pool.acquire().await.unwrap();
        let id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let pooled = pool.acquire().await.unwrap();
                let id = pooled.id();
                pool.release(pooled).await;
                id
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held).await;

        assert_eq!(waiter.await.unwrap(), id);
        assert_eq!(pool.stats().total_created, 1);
    }

    #[tokio::test]
    async fn test_broken_instance_is_discarded_on_release() {
        let state = MockState::new();
        let pool = pool(&state, 2, Duration::from_secs(1));

        let pooled = pool.acquire().await.unwrap();
        let id = pooled.id();
        pooled
            .connection()
            .on_exception(&TransportError::Send("broken pipe".to_string()));
        assert_eq!(pooled.status(), ConnectionStatus::Error);

        let connection = Arc::clone(pooled.connection());
        pool.release(pooled).await;

        assert_eq!(pool.live_count(), 0);
        assert_eq!(connection.status(), ConnectionStatus::Stopped);
        assert_eq!(pool.stats().total_discarded, 1);

        // Recreated lazily
        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(pool.stats().total_created, 2);
        pool.release(fresh).await;
    }

    #[tokio::test]
    async fn test_idle_instance_that_broke_is_not_handed_out() {
        let state = MockState::new();
        let pool = pool(&state, 2, Duration::from_secs(1));

        let pooled = pool.acquire().await.unwrap();
        let connection = Arc::clone(pooled.connection());
        pool.release(pooled).await;

        // Fails while sitting idle
        connection.on_exception(&TransportError::Send("reset".to_string()));

        let next = pool.acquire().await.unwrap();
        assert_ne!(next.connection().name(), connection.name());
        assert_eq!(connection.status(), ConnectionStatus::Stopped);
        assert_eq!(pool.live_count(), 1);
        pool.release(next).await;
    }

    #[tokio::test]
    async fn test_failed_creation_reports_unavailable() {
        let state = MockState::new();
        state.fail_connects.store(1, Ordering::SeqCst);
        let pool = pool(&state, 2, Duration::from_secs(1));

        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Unavailable(ConnectionStatus::Error))));
        assert_eq!(pool.live_count(), 0);

        // The backend is back
        let pooled = pool.acquire().await.unwrap();
        assert!(pooled.is_usable());
        pool.release(pooled).await;
    }

    #[tokio::test]
    async fn test_expire_all_discards_idle_and_checked_out() {
        let state = MockState::new();
        let pool = pool(&state, 3, Duration::from_secs(1));

        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(idle).await;
        assert_eq!(pool.stats().live, 2);

        pool.expire_all().await;

        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.stats().idle, 0);
        assert!(pool.is_closed());
        assert_eq!(held.status(), ConnectionStatus::Stopped);

        // Late release of an in-flight instance is harmless
        pool.release(held).await;
        assert_eq!(pool.live_count(), 0);

        assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_cancelled_acquire_during_connect_frees_slot() {
        let state = MockState::new();
        *state.connect_delay.lock() = Duration::from_millis(200);
        let pool = pool(&state, 1, Duration::from_secs(1));

        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.live_count(), 0);

        *state.connect_delay.lock() = Duration::ZERO;
        let pooled = pool.acquire().await.unwrap();
        assert!(pooled.is_usable());

        let stats = pool.stats();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_discarded, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        pool.release(pooled).await;
    }

    #[tokio::test]
    async fn test_dropped_instance_returns_to_pool() {
        let state = MockState::new();
        let pool = pool(&state, 1, Duration::from_millis(200));

        let pooled = pool.acquire().await.unwrap();
        let id = pooled.id();
        drop(pooled);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.checked_out, 0);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        assert!(again.is_checked_out());
        pool.release(again).await;
    }

    #[tokio::test]
    async fn test_dropped_broken_instance_is_discarded() {
        let state = MockState::new();
        let pool = pool(&state, 1, Duration::from_millis(200));

        let pooled = pool.acquire().await.unwrap();
        pooled
            .connection()
            .on_exception(&TransportError::Send("reset".to_string()));
        let connection = Arc::clone(pooled.connection());
        drop(pooled);

        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.stats().total_discarded, 1);

        // Stopped in the background
        for _ in 0..100 {
            if connection.status() == ConnectionStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(connection.status(), ConnectionStatus::Stopped);
        assert!(!connection.reconnector().is_reconnecting());
    }
}
