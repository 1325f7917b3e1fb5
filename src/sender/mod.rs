//! Message dispatch
//!
//! This module provides:
//! - A never-blocking producer entry point with a bounded queue
//! - An elastic set of worker tasks delivering through the connectable pool
//! - Bounded, idempotent shutdown

pub mod dispatcher;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, DispatcherStats};
