//! njams-sender - asynchronous delivery of monitoring messages over pooled,
//! self-healing transport connections

pub mod config;
pub mod connection;
pub mod connector;
pub mod core;
pub mod message;
pub mod pool;
pub mod sender;

#[cfg(test)]
mod test_support;

pub use config::SenderConfig;
pub use connection::{Connection, ConnectionStatus};
pub use connector::{Connector, ConnectorFactory, TransportError};
pub use core::{Core, CoreStats};
pub use message::{MessageKind, OutboundMessage};
pub use pool::{ConnectablePool, PoolError};
pub use sender::{DispatchError, Dispatcher};
