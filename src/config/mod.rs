use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::connector::tcp::parse_endpoint;
use crate::pool::PoolConfig;
use crate::sender::DispatcherConfig;

/// Minimum number of sender workers
pub const PROPERTY_MIN_QUEUE_LENGTH: &str = "minQueueLength";

/// Maximum number of sender workers, also the queue capacity
pub const PROPERTY_MAX_QUEUE_LENGTH: &str = "maxQueueLength";

/// Idle time in milliseconds before a surplus worker retires
pub const PROPERTY_SENDER_THREAD_IDLE_TIME: &str = "senderThreadIdleTime";

/// Milliseconds between two reconnect attempts
pub const PROPERTY_RECONNECT_INTERVAL: &str = "reconnectInterval";

/// Maximum number of pooled connections
pub const PROPERTY_MAX_CONNECTIONS: &str = "maxConnections";

/// Milliseconds to wait for a pooled connection
pub const PROPERTY_ACQUIRE_TIMEOUT: &str = "acquireTimeout";

/// Milliseconds granted to in-flight sends on shutdown
pub const PROPERTY_SHUTDOWN_GRACE: &str = "shutdownGrace";

/// Transport kind: tcp or channel
pub const PROPERTY_TRANSPORT: &str = "transport";

/// Transport endpoint, `host:port` or `tcp://host:port`
pub const PROPERTY_ENDPOINT: &str = "endpoint";

/// Environment variables read by [`load_from_env`], with the property each one sets
const ENV_PROPERTIES: &[(&str, &str)] = &[
    ("NJAMS_MIN_QUEUE_LENGTH", PROPERTY_MIN_QUEUE_LENGTH),
    ("NJAMS_MAX_QUEUE_LENGTH", PROPERTY_MAX_QUEUE_LENGTH),
    ("NJAMS_SENDER_THREAD_IDLE_TIME", PROPERTY_SENDER_THREAD_IDLE_TIME),
    ("NJAMS_RECONNECT_INTERVAL", PROPERTY_RECONNECT_INTERVAL),
    ("NJAMS_MAX_CONNECTIONS", PROPERTY_MAX_CONNECTIONS),
    ("NJAMS_ACQUIRE_TIMEOUT", PROPERTY_ACQUIRE_TIMEOUT),
    ("NJAMS_SHUTDOWN_GRACE", PROPERTY_SHUTDOWN_GRACE),
    ("NJAMS_TRANSPORT", PROPERTY_TRANSPORT),
    ("NJAMS_ENDPOINT", PROPERTY_ENDPOINT),
];

/// Transport used for every pooled connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON over TCP
    #[default]
    Tcp,

    /// In-process channel
    Channel,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "channel" => Ok(Self::Channel),
            other => anyhow::bail!("Unknown transport '{}' (expected tcp or channel)", other),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

/// Sender configuration
///
/// Keys use the camelCase property names; all durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderConfig {
    /// Minimum number of workers (default: 1)
    #[serde(default = "default_min_queue_length")]
    pub min_queue_length: usize,

    /// Maximum number of workers and queue capacity (default: 8)
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    /// Idle time before a surplus worker retires (default: 10000)
    #[serde(default = "default_sender_thread_idle_time")]
    pub sender_thread_idle_time: u64,

    /// Wait between reconnect attempts (default: 1000)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Pool bound; defaults to `max_queue_length`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Wait for a pooled connection (default: 5000)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,

    /// Grace for in-flight sends on shutdown (default: 10000)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// Transport kind (default: tcp)
    #[serde(default)]
    pub transport: TransportKind,

    /// Transport endpoint (default: 127.0.0.1:6000)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_min_queue_length() -> usize {
    1
}

fn default_max_queue_length() -> usize {
    8
}

fn default_sender_thread_idle_time() -> u64 {
    10_000
}

fn default_reconnect_interval() -> u64 {
    1_000
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_shutdown_grace() -> u64 {
    10_000
}

fn default_endpoint() -> String {
    "127.0.0.1:6000".to_string()
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            min_queue_length: default_min_queue_length(),
            max_queue_length: default_max_queue_length(),
            sender_thread_idle_time: default_sender_thread_idle_time(),
            reconnect_interval: default_reconnect_interval(),
            max_connections: None,
            acquire_timeout: default_acquire_timeout(),
            shutdown_grace: default_shutdown_grace(),
            transport: TransportKind::default(),
            endpoint: default_endpoint(),
        }
    }
}

impl SenderConfig {
    /// Build a configuration from string properties
    ///
    /// Unknown keys are ignored. A value that does not parse keeps the
    /// default and is logged.
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let defaults = Self::default();

        let max_connections = properties
            .get(PROPERTY_MAX_CONNECTIONS)
            .and_then(|raw| parse_value(PROPERTY_MAX_CONNECTIONS, raw));

        Self {
            min_queue_length: property(properties, PROPERTY_MIN_QUEUE_LENGTH, defaults.min_queue_length),
            max_queue_length: property(properties, PROPERTY_MAX_QUEUE_LENGTH, defaults.max_queue_length),
            sender_thread_idle_time: property(
                properties,
                PROPERTY_SENDER_THREAD_IDLE_TIME,
                defaults.sender_thread_idle_time,
            ),
            reconnect_interval: property(properties, PROPERTY_RECONNECT_INTERVAL, defaults.reconnect_interval),
            max_connections,
            acquire_timeout: property(properties, PROPERTY_ACQUIRE_TIMEOUT, defaults.acquire_timeout),
            shutdown_grace: property(properties, PROPERTY_SHUTDOWN_GRACE, defaults.shutdown_grace),
            transport: property(properties, PROPERTY_TRANSPORT, defaults.transport),
            endpoint: properties
                .get(PROPERTY_ENDPOINT)
                .map(|endpoint| endpoint.trim().to_string())
                .unwrap_or(defaults.endpoint),
        }
    }

    /// Check the settings against each other
    pub fn validate(&self) -> Result<()> {
        if self.min_queue_length < 1 {
            anyhow::bail!("{} must be at least 1", PROPERTY_MIN_QUEUE_LENGTH);
        }

        if self.max_queue_length < self.min_queue_length {
            anyhow::bail!(
                "{} ({}) must not be below {} ({})",
                PROPERTY_MAX_QUEUE_LENGTH,
                self.max_queue_length,
                PROPERTY_MIN_QUEUE_LENGTH,
                self.min_queue_length
            );
        }

        if self.max_connections() < 1 {
            anyhow::bail!("{} must be at least 1", PROPERTY_MAX_CONNECTIONS);
        }

        if self.transport == TransportKind::Tcp {
            parse_endpoint(&self.endpoint)
                .with_context(|| format!("Invalid {} for tcp transport", PROPERTY_ENDPOINT))?;
        }

        Ok(())
    }

    /// Effective pool bound
    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(self.max_queue_length)
    }

    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.sender_thread_idle_time)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace)
    }

    /// Settings for the connectable pool
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections(),
            acquire_timeout: self.acquire_timeout(),
            reconnect_interval: self.reconnect_interval(),
        }
    }

    /// Settings for the dispatcher
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            min_workers: self.min_queue_length,
            max_workers: self.max_queue_length,
            queue_capacity: self.max_queue_length,
            idle_time: self.idle_time(),
            shutdown_grace: self.shutdown_grace(),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = key, value = raw, "Ignoring unparsable property, using default");
            None
        }
    }
}

fn property<T: FromStr>(properties: &HashMap<String, String>, key: &str, default: T) -> T {
    properties
        .get(key)
        .and_then(|raw| parse_value(key, raw))
        .unwrap_or(default)
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<SenderConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: SenderConfig = serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Every setting is optional:
/// - NJAMS_MIN_QUEUE_LENGTH / NJAMS_MAX_QUEUE_LENGTH
/// - NJAMS_SENDER_THREAD_IDLE_TIME (ms)
/// - NJAMS_RECONNECT_INTERVAL (ms)
/// - NJAMS_MAX_CONNECTIONS
/// - NJAMS_ACQUIRE_TIMEOUT / NJAMS_SHUTDOWN_GRACE (ms)
/// - NJAMS_TRANSPORT (tcp or channel)
/// - NJAMS_ENDPOINT
///
/// A `.env` file is honoured when present.
pub fn load_from_env() -> Result<SenderConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let properties: HashMap<String, String> = ENV_PROPERTIES
        .iter()
        .filter_map(|(var, key)| std::env::var(var).ok().map(|value| (key.to_string(), value)))
        .collect();

    Ok(SenderConfig::from_properties(&properties))
}

/// Load configuration from file or environment, then validate it
///
/// Reads the YAML file when a path is given, the environment otherwise.
pub fn load_config(config_path: Option<&str>) -> Result<SenderConfig> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    config.validate().context("Invalid sender configuration")?;

    Ok(config)
}
