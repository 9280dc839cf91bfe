//! Typed payloads for the recognized discriminants.
//!
//! Decoding is lenient: the backend fills in different subsets of fields
//! depending on which code path produced the frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `message` / `agent_response` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Reasoning steps the backend inlines into agent replies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning_steps: Vec<ReasoningPayload>,
    /// Tool usage records the backend inlines into agent replies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_usage: Vec<Value>,
}

/// `reasoning` / `thought` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningPayload {
    #[serde(alias = "content")]
    pub description: String,
    #[serde(default = "default_reasoning_type", rename = "type")]
    pub step_type: String,
}

fn default_reasoning_type() -> String {
    "thinking".to_string()
}

/// `tool_call` / `tool_result` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub result: Value,
}

/// `status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(alias = "status")]
    pub content: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// `typing` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

const fn default_active() -> bool {
    true
}

/// `handoff` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPayload {
    #[serde(default)]
    pub from_agent_id: Option<String>,
    pub to_agent_id: String,
    #[serde(default)]
    pub to_agent_name: Option<String>,
}
