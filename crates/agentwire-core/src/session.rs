//! Session identity and status.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, never connected.
    #[default]
    Idle,
    /// Transport open in progress.
    Connecting,
    /// Transport open; outbound traffic flows.
    Open,
    /// Waiting for the reconnect timer.
    Reconnecting,
    /// Closed by the caller. No retry.
    Closed,
    /// Reconnect attempts exhausted. Needs an explicit `connect()`.
    Failed,
}

impl SessionStatus {
    /// Closed or Failed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Wire/log name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live conversation binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Agent the session is bound to.
    pub bound_agent_id: String,
    /// Current status.
    pub status: SessionStatus,
}

impl Session {
    /// Create an idle session bound to `agent_id`.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bound_agent_id: agent_id.into(),
            status: SessionStatus::Idle,
        }
    }
}
