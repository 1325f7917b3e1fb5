//! Outbound monitoring messages
//!
//! Every message handed to the dispatcher is one of three kinds:
//! - **Log**: a process log / job event
//! - **Project**: a process model description
//! - **Trace**: tracing configuration for a process
//!
//! Transports put the message headers next to the JSON body; the header
//! names and values here are what the monitoring backend routes on.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message format version sent with every message
pub const MESSAGE_VERSION: &str = "V4";

/// Header carrying [`MESSAGE_VERSION`]
pub const HEADER_MESSAGE_VERSION: &str = "NJAMS_MESSAGEVERSION";

/// Header carrying the [`MessageKind::message_type`] value
pub const HEADER_MESSAGE_TYPE: &str = "NJAMS_MESSAGETYPE";

/// Header carrying the process path the message belongs to
pub const HEADER_PATH: &str = "NJAMS_PATH";

/// Header carrying the log id (log messages only)
pub const HEADER_LOG_ID: &str = "NJAMS_LOGID";

/// Kind of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Process log / job event
    Log,

    /// Process model
    Project,

    /// Trace configuration
    Trace,
}

impl MessageKind {
    /// Value of the message type header
    pub fn message_type(&self) -> &'static str {
        match self {
            MessageKind::Log => "event",
            MessageKind::Project => "project",
            MessageKind::Trace => "trace",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_type())
    }
}

/// A single monitoring message on its way to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// What kind of record this is
    pub kind: MessageKind,

    /// Process path, e.g. `>prod>orders>intake>`
    pub path: String,

    /// Log id, only set for log messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,

    /// When the producer created the message
    pub created_at: DateTime<Utc>,

    /// Message body as produced by the instrumentation layer
    pub body: serde_json::Value,
}

impl OutboundMessage {
    fn new(kind: MessageKind, path: impl Into<String>, log_id: Option<String>, body: serde_json::Value) -> Self {
        Self {
            kind,
            path: path.into(),
            log_id,
            created_at: Utc::now(),
            body,
        }
    }

    /// Create a log message
    pub fn log(path: impl Into<String>, log_id: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(MessageKind::Log, path, Some(log_id.into()), body)
    }

    /// Create a project message
    pub fn project(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(MessageKind::Project, path, None, body)
    }

    /// Create a trace message
    pub fn trace(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(MessageKind::Trace, path, None, body)
    }

    /// Transport headers, in the order they are written
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(4);
        if let (MessageKind::Log, Some(log_id)) = (self.kind, &self.log_id) {
            headers.push((HEADER_LOG_ID, log_id.clone()));
        }
        headers.push((HEADER_MESSAGE_VERSION, MESSAGE_VERSION.to_string()));
        headers.push((HEADER_MESSAGE_TYPE, self.kind.message_type().to_string()));
        headers.push((HEADER_PATH, self.path.clone()));
        headers
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encode the message as a single JSON line with its headers embedded
    ///
    /// The line does not contain the trailing newline.
    pub fn to_wire_line(&self) -> Result<Bytes, serde_json::Error> {
        let headers: serde_json::Map<String, serde_json::Value> = self
            .headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), serde_json::Value::String(value)))
            .collect();

        let envelope = serde_json::json!({
            "headers": headers,
            "message": self,
        });

        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.log_id {
            Some(log_id) => write!(f, "{} {} ({})", self.kind, self.path, log_id),
            None => write!(f, "{} {}", self.kind, self.path),
        }
    }
}
