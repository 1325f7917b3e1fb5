//! Connection status and its transition rules
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Error -> Connecting -> ...
//!       any state -> Stopping -> Stopped
//! ```
//!
//! `Stopping` only moves on to `Stopped`, and `Stopped` is absorbing.

use std::fmt;

/// Status of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Not connected; the initial status
    Disconnected,

    /// A connect attempt is in progress
    Connecting,

    /// Usable for sending
    Connected,

    /// The transport failed; a reconnect episode owns recovery
    Error,

    /// Shutting down; only `Stopped` may follow
    Stopping,

    /// Shut down for good
    Stopped,
}

/// A status change the state machine refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection status can't be changed to {to}, because status is {from}")]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

impl ConnectionStatus {
    /// Get a human-readable status name
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Error => "ERROR",
            ConnectionStatus::Stopping => "STOPPING",
            ConnectionStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, ConnectionStatus::Stopping | ConnectionStatus::Stopped)
    }

    /// Whether a pooled instance in this status must be thrown away
    pub fn is_broken(&self) -> bool {
        matches!(self, ConnectionStatus::Error | ConnectionStatus::Stopped)
    }

    /// Check whether moving from `self` to `to` is allowed
    pub fn check_transition(self, to: ConnectionStatus) -> Result<(), InvalidTransition> {
        let allowed = match self {
            ConnectionStatus::Stopped => false,
            ConnectionStatus::Stopping => to == ConnectionStatus::Stopped,
            _ => true,
        };

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
