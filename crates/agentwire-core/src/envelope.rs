//! Wire envelope.
//!
//! Every frame crossing the persistent channel is one JSON object with a
//! `type` discriminant, a `payload`, and optional `id` and `timestamp`.
//! [`Envelope::parse`] is the single validation point: anything that gets past
//! it is well-formed, so handlers never re-check the shape.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Fields that are part of the envelope itself rather than its payload.
const RESERVED_FIELDS: [&str; 4] = ["type", "payload", "id", "timestamp"];

/// Envelope discriminant.
///
/// Unknown discriminants are kept as [`EnvelopeKind::Other`]; they are valid
/// values that simply have no handler unless one is registered for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    /// User chat message.
    Message,
    /// Agent reply. The backend also calls it `agent_message`.
    AgentResponse,
    /// Connectivity or agent status update.
    Status,
    /// User-visible error.
    Error,
    /// Typing indicator.
    Typing,
    /// Tool invocation (`tool_request` on the backend).
    ToolCall,
    /// Tool output (`tool_response` on the backend).
    ToolResult,
    /// Reasoning step.
    Reasoning,
    /// Free-form thought.
    Thought,
    /// Keepalive request.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Conversation moved to another agent.
    Handoff,
    /// Any other discriminant.
    Other(String),
}

impl EnvelopeKind {
    /// Canonical wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::AgentResponse => "agent_response",
            Self::Status => "status",
            Self::Error => "error",
            Self::Typing => "typing",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Reasoning => "reasoning",
            Self::Thought => "thought",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Handoff => "handoff",
            Self::Other(name) => name,
        }
    }

    /// Parse a wire name, folding backend aliases onto their canonical kind.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "message" => Self::Message,
            "agent_response" | "agent_message" => Self::AgentResponse,
            "status" => Self::Status,
            "error" => Self::Error,
            "typing" => Self::Typing,
            "tool_call" | "tool_request" => Self::ToolCall,
            "tool_result" | "tool_response" => Self::ToolResult,
            "reasoning" => Self::Reasoning,
            "thought" => Self::Thought,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "handoff" => Self::Handoff,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this is one of the discriminants the protocol defines.
    #[must_use]
    pub const fn is_recognized(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// The consumer this discriminant is routed to, if any.
    #[must_use]
    pub const fn consumer(&self) -> Option<Consumer> {
        match self {
            Self::Message | Self::AgentResponse => Some(Consumer::Transcript),
            Self::Reasoning | Self::Thought => Some(Consumer::ReasoningTrace),
            Self::ToolCall | Self::ToolResult => Some(Consumer::ToolUsage),
            Self::Typing => Some(Consumer::TypingIndicator),
            Self::Status => Some(Consumer::ConnectivityBanner),
            Self::Error => Some(Consumer::ErrorSurface),
            Self::Ping | Self::Pong => Some(Consumer::Liveness),
            Self::Handoff => Some(Consumer::Handoff),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EnvelopeKind {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<&str> for EnvelopeKind {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// UI-side consumer of inbound envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consumer {
    Transcript,
    ReasoningTrace,
    ToolUsage,
    TypingIndicator,
    ConnectivityBanner,
    ErrorSurface,
    Liveness,
    Handoff,
}

impl Consumer {
    /// Every discriminant routed to this consumer.
    #[must_use]
    pub fn kinds(self) -> Vec<EnvelopeKind> {
        match self {
            Self::Transcript => vec![EnvelopeKind::Message, EnvelopeKind::AgentResponse],
            Self::ReasoningTrace => vec![EnvelopeKind::Reasoning, EnvelopeKind::Thought],
            Self::ToolUsage => vec![EnvelopeKind::ToolCall, EnvelopeKind::ToolResult],
            Self::TypingIndicator => vec![EnvelopeKind::Typing],
            Self::ConnectivityBanner => vec![EnvelopeKind::Status],
            Self::ErrorSurface => vec![EnvelopeKind::Error],
            Self::Liveness => vec![EnvelopeKind::Ping, EnvelopeKind::Pong],
            Self::Handoff => vec![EnvelopeKind::Handoff],
        }
    }
}

/// One unit of protocol traffic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Discriminant.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Structured payload.
    pub payload: Value,
    /// Opaque id, used for diagnostics only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// When the envelope was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create an envelope without id or timestamp.
    pub fn new(kind: impl Into<EnvelopeKind>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            id: None,
            timestamp: None,
        }
    }

    /// Create an outbound envelope stamped with a fresh id and the current time.
    pub fn outbound(kind: impl Into<EnvelopeKind>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now()),
        }
    }

    /// Parse and validate one inbound text frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the frame is not a well-formed envelope.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Validate an already-decoded JSON value.
    ///
    /// Frames without a `payload` key are flat: every non-reserved field is
    /// collected into an object payload.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the value is not a well-formed envelope.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = match fields.remove("type") {
            Some(Value::String(name)) if !name.trim().is_empty() => EnvelopeKind::from_name(&name),
            _ => return Err(ProtocolError::MissingType),
        };

        let id = match fields.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            Some(_) => return Err(ProtocolError::InvalidId),
        };

        let timestamp = match fields.remove("timestamp") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(parse_timestamp(&raw)?),
            Some(other) => return Err(ProtocolError::InvalidTimestamp(other.to_string())),
        };

        let payload = fields.remove("payload").unwrap_or_else(|| {
            let flat: Map<String, Value> = fields
                .into_iter()
                .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
                .collect();
            Value::Object(flat)
        });

        Ok(Self {
            kind,
            payload,
            id,
            timestamp,
        })
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode the payload into a typed structure.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidPayload`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|source| ProtocolError::InvalidPayload {
            kind: self.kind.to_string(),
            source,
        })
    }

    /// Look up a string field of an object payload.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Accept RFC 3339 as well as the naive ISO-8601 form the backend emits.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ProtocolError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ProtocolError::InvalidTimestamp(raw.to_string()))
}
