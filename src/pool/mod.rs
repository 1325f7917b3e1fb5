//! Connectable pooling
//!
//! This module provides:
//! - A [`Connectable`] wrapper pairing one connection with usage bookkeeping
//! - A bounded [`ConnectablePool`] with exclusive checkout
//! - Discarding of broken instances on checkout and release

pub mod connectable;
pub mod connectable_pool;

pub use connectable::Connectable;
pub use connectable_pool::{ConnectablePool, PoolConfig, PoolError, PoolStats, PooledConnectable};
