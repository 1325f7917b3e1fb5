//! Connection state machine with automatic reconnection
//!
//! A [`Connection`] binds one [`Connector`] to its [`ConnectionStatus`] and
//! one [`Reconnector`]. It is the only way to reach the connector:
//! - connect / send / close calls are serialized through one async lock
//! - every status change goes through one transition check
//! - transport failures are contained here and turned into a background
//!   reconnect episode; callers only ever see a `Result`

pub mod reconnector;
pub mod status;

pub use reconnector::Reconnector;
pub use status::{ConnectionStatus, InvalidTransition};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, info, info_span, trace, warn, Span};

use crate::connector::{Connector, TransportError};
use crate::message::OutboundMessage;

/// Upper bound for closing the connector while stopping
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Status changes buffered for each subscriber
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// One transport connection and its lifecycle
pub struct Connection {
    /// Name used in logs
    name: String,

    /// Current status; every change is checked against the transition rules
    status: Mutex<ConnectionStatus>,

    /// The transport; `None` once the connection has been stopped
    connector: AsyncMutex<Option<Box<dyn Connector>>>,

    reconnector: Reconnector,

    /// Broadcasts every applied status change
    transitions: broadcast::Sender<ConnectionStatus>,

    span: Span,
}

impl Connection {
    /// Create a disconnected connection around `connector`
    pub fn new(name: impl Into<String>, connector: Box<dyn Connector>, reconnect_interval: Duration) -> Arc<Self> {
        let name = name.into();
        let span = info_span!("connection", name = %name, transport = connector.name());
        let (transitions, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Arc::new_cyclic(|connection| Self {
            reconnector: Reconnector::new(connection.clone(), reconnect_interval, span.clone()),
            name,
            status: Mutex::new(ConnectionStatus::Disconnected),
            connector: AsyncMutex::new(Some(connector)),
            transitions,
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_error(&self) -> bool {
        self.status() == ConnectionStatus::Error
    }

    pub fn is_stopping_or_stopped(&self) -> bool {
        self.status().is_stopping_or_stopped()
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.reconnector
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnector.interval()
    }

    /// Receive every status change applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.transitions.subscribe()
    }

    /// Connect once; on failure hand recovery to the reconnector
    ///
    /// Never returns the connect error: the caller learns the outcome from
    /// [`Connection::status`].
    pub async fn initial_connect(&self) {
        info!(parent: &self.span, "Connecting");
        match self.connect_once().await {
            Ok(()) => info!(parent: &self.span, "Connected"),
            Err(e) => {
                error!(
                    parent: &self.span,
                    error = %e,
                    "Unable to establish connection, pushing reconnect task to background"
                );
                self.on_exception(&e);
            }
        }
    }

    /// Report a transport failure
    ///
    /// The first report wins and starts one reconnect episode; reports that
    /// arrive while that episode runs, or after the connection started
    /// stopping, are ignored.
    pub fn on_exception(&self, error: &TransportError) {
        if self.is_stopping_or_stopped() {
            trace!(parent: &self.span, error = %error, "Ignoring failure of a stopped connection");
            return;
        }

        if !self.reconnector.try_begin() {
            trace!(parent: &self.span, error = %error, "Connection is already reconnecting");
            return;
        }

        self.change_status(ConnectionStatus::Error);
        warn!(parent: &self.span, error = %error, "Connection failed");
        self.reconnector.reconnect(error.to_string());
    }

    /// Close the transport and go back to `Disconnected`
    ///
    /// Close errors are logged and reported as `false`.
    pub async fn try_to_close(&self) -> bool {
        self.change_status(ConnectionStatus::Disconnected);

        let mut connector = self.connector.lock().await;
        match connector.as_mut() {
            Some(connector) => match connector.close().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(parent: &self.span, error = %e, "Unable to close connection");
                    false
                }
            },
            None => false,
        }
    }

    /// Stop the connection for good
    ///
    /// Halts reconnection, closes the transport and ends in `Stopped`.
    /// Calling it again does nothing.
    pub async fn stop(&self) {
        if !self.begin_stop() {
            trace!(parent: &self.span, "Connection is already stopping");
            return;
        }

        self.reconnector.stop_reconnecting();

        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut connector = self.connector.lock().await;
            if let Some(mut connector) = connector.take() {
                if let Err(e) = connector.close().await {
                    debug!(parent: &self.span, error = %e, "Unable to close connection");
                }
            }
        })
        .await;

        if closed.is_err() {
            warn!(
                parent: &self.span,
                timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                "Connector busy, abandoning close"
            );
        }

        self.change_status(ConnectionStatus::Stopped);
        info!(parent: &self.span, "Connection stopped");
    }

    /// Send one message over the transport
    ///
    /// Only valid while connected. A transport failure starts recovery
    /// before the error is handed back.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected(status));
        }

        let result = {
            let mut connector = self.connector.lock().await;
            match connector.as_mut() {
                Some(connector) => connector.send(message).await,
                None => Err(TransportError::Stopped),
            }
        };

        if let Err(e) = &result {
            if !matches!(e, TransportError::Stopped) {
                self.on_exception(e);
            }
        }

        result
    }

    /// One connect attempt; used by `initial_connect` and the reconnector
    pub(crate) async fn connect_once(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        if !self.change_status(ConnectionStatus::Connecting) {
            return Err(TransportError::Stopped);
        }

        let mut guard = self.connector.lock().await;
        let Some(connector) = guard.as_mut() else {
            return Err(TransportError::Stopped);
        };

        match connector.connect().await {
            Ok(()) => {
                if self.mark_connected() {
                    Ok(())
                } else {
                    // Stopped while connecting
                    self.close_quietly(connector).await;
                    Err(TransportError::Stopped)
                }
            }
            Err(e) => {
                self.close_quietly(connector).await;
                self.change_status(ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    /// Close the transport without touching the status
    pub(crate) async fn close_connector(&self) {
        let mut guard = self.connector.lock().await;
        if let Some(connector) = guard.as_mut() {
            self.close_quietly(connector).await;
        }
    }

    async fn close_quietly(&self, connector: &mut Box<dyn Connector>) {
        if let Err(e) = connector.close().await {
            debug!(parent: &self.span, error = %e, "Unable to close connection");
        }
    }

    /// Apply a status change if the transition rules allow it
    fn change_status(&self, to: ConnectionStatus) -> bool {
        let mut status = self.status.lock();
        self.apply(&mut status, to)
    }

    /// Move to `Connected` and end the reconnect episode in one step
    ///
    /// Sends only start once the status is `Connected`, so their failures
    /// always find the reconnecting flag already cleared.
    fn mark_connected(&self) -> bool {
        let mut status = self.status.lock();
        let applied = self.apply(&mut status, ConnectionStatus::Connected);
        if applied {
            self.reconnector.finish();
        }
        applied
    }

    fn begin_stop(&self) -> bool {
        let mut status = self.status.lock();
        if status.is_stopping_or_stopped() {
            return false;
        }
        self.apply(&mut status, ConnectionStatus::Stopping)
    }

    fn apply(&self, status: &mut ConnectionStatus, to: ConnectionStatus) -> bool {
        match status.check_transition(to) {
            Ok(()) => {
                let from = *status;
                *status = to;
                if from != to {
                    trace!(parent: &self.span, from = %from, to = %to, "Connection status changed");
                    // Nobody listening is fine
                    let _ = self.transitions.send(to);
                }
                true
            }
            Err(e) => {
                trace!(parent: &self.span, error = %e, "Ignoring status change");
                false
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("reconnecting", &self.reconnector.is_reconnecting())
            .finish()
    }
}
