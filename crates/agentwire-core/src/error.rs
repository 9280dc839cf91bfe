//! Error taxonomy.
//!
//! Only [`ClientError::ReconnectExhausted`] is meant to reach callers as a
//! blocking failure. Everything else is handled where it occurs and is only
//! observable through the status feed and logs.

use std::time::Duration;

use thiserror::Error;

/// Transient transport failure. Retried by the connection manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failed to open transport: {0}")]
    Open(String),
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport read failed: {0}")]
    Read(String),
    #[error("transport write failed: {0}")]
    Write(String),
    #[error("transport closed by peer (code {code:?}): {reason}")]
    ClosedByPeer { code: Option<u16>, reason: String },
    #[error("transport stream ended without a close frame")]
    StreamEnded,
    #[error("no open transport")]
    NotOpen,
}

/// Malformed inbound frame. Logged and dropped by the router.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no non-empty string `type` field")]
    MissingType,
    #[error("envelope `id` must be a string or an integer")]
    InvalidId,
    #[error("unparsable envelope timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("payload of `{kind}` envelope does not match the expected shape: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single transmit attempt failed. The envelope stays queued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("send of envelope {envelope_id:?} failed: {source}")]
pub struct SendFailure {
    pub envelope_id: Option<String>,
    #[source]
    pub source: ConnectionError,
}

impl SendFailure {
    /// Wrap a transport error for the envelope with the given id.
    #[must_use]
    pub const fn new(envelope_id: Option<String>, source: ConnectionError) -> Self {
        Self {
            envelope_id,
            source,
        }
    }
}

/// Error raised by an inbound event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Payload(#[from] ProtocolError),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Create a free-form handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("agent id must not be empty")]
    EmptyAgentId,
    #[error("invalid reconnect policy: {0}")]
    InvalidPolicy(String),
}

/// Caller-facing client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("reconnect attempts exhausted after {attempts} retries")]
    ReconnectExhausted { attempts: u32 },
    #[error("session was closed")]
    Closed,
    #[error("session client has stopped")]
    Stopped,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
