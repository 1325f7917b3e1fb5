//! Background reconnection
//!
//! A [`Reconnector`] belongs to exactly one [`Connection`]. When the
//! connection fails, the first failure report wins the `reconnecting` flag
//! and starts one reconnect task; every other report sees the flag and
//! backs off. The task retries at a fixed interval until the connection is
//! usable again or the reconnector is cancelled.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::Connection;
use crate::connector::TransportError;

/// Shared between the reconnector and its running task
#[derive(Debug, Default)]
struct ReconnectState {
    /// Set while a reconnect episode owns recovery
    reconnecting: AtomicBool,

    /// Reconnect tasks currently alive
    live_tasks: AtomicUsize,

    /// Reconnect episodes started so far
    episodes: AtomicU64,

    /// Connect attempts made by reconnect tasks
    attempts: AtomicU64,
}

/// Decrements the live task count when the task ends, however it ends
struct LiveTask(Arc<ReconnectState>);

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Retry loop bound to one connection
pub struct Reconnector {
    /// Back-reference to the owning connection
    connection: Weak<Connection>,

    /// Wait between two connect attempts
    interval: Duration,

    state: Arc<ReconnectState>,

    /// Cancelled by `stop_reconnecting`
    cancel: CancellationToken,

    span: Span,
}

impl Reconnector {
    pub(crate) fn new(connection: Weak<Connection>, interval: Duration, span: Span) -> Self {
        Self {
            connection,
            interval,
            state: Arc::new(ReconnectState::default()),
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Wait between two connect attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a reconnect episode currently owns recovery
    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::SeqCst)
    }

    /// Number of reconnect tasks currently alive
    pub fn live_tasks(&self) -> usize {
        self.state.live_tasks.load(Ordering::SeqCst)
    }

    /// Number of reconnect episodes started so far
    pub fn episodes(&self) -> u64 {
        self.state.episodes.load(Ordering::SeqCst)
    }

    /// Number of connect attempts made while reconnecting
    pub fn attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Whether `stop_reconnecting` has been called
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the reconnecting flag; only one caller wins until it is cleared
    pub(crate) fn try_begin(&self) -> bool {
        self.state
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear the reconnecting flag once the connection is usable again
    pub(crate) fn finish(&self) {
        self.state.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Start the reconnect task; the caller must have won `try_begin`
    pub(crate) fn reconnect(&self, cause: String) {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(parent: &self.span, error = %e, "No async runtime available, unable to reconnect");
                self.finish();
                return;
            }
        };

        self.state.episodes.fetch_add(1, Ordering::SeqCst);
        self.state.live_tasks.fetch_add(1, Ordering::SeqCst);

        let task = ReconnectTask {
            connection: self.connection.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            interval: self.interval,
        };
        runtime.spawn(task.run(cause).instrument(self.span.clone()));
    }

    /// Stop any running reconnect task and refuse to start new ones
    ///
    /// A connect attempt already in flight runs to completion; its result is
    /// discarded by the stopped connection.
    pub fn stop_reconnecting(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReconnectTask {
    connection: Weak<Connection>,
    state: Arc<ReconnectState>,
    cancel: CancellationToken,
    interval: Duration,
}

impl ReconnectTask {
    async fn run(self, cause: String) {
        let _live = LiveTask(Arc::clone(&self.state));

        info!(
            cause = %cause,
            interval_ms = self.interval.as_millis() as u64,
            "Connection lost, reconnecting"
        );

        if let Some(connection) = self.connection.upgrade() {
            connection.close_connector().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Reconnecting stopped");
                    self.state.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let Some(connection) = self.connection.upgrade() else {
                debug!("Connection dropped, giving up reconnecting");
                return;
            };

            let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match connection.connect_once().await {
                Ok(()) => {
                    info!(attempt = attempt, "Connection re-established");
                    return;
                }
                Err(TransportError::Stopped) => {
                    debug!(attempt = attempt, "Connection stopped while reconnecting");
                    self.state.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        error = %e,
                        retry_in_ms = self.interval.as_millis() as u64,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }
}
