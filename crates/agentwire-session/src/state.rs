//! Conversation identity and agent binding.

use std::sync::Arc;

use agentwire_core::{
    ConfigError, Endpoint, Envelope, EnvelopeKind, Session, SessionEvent, SessionId,
    SessionStatus, StatusFeed,
};
use serde_json::json;
use tokio::sync::watch;
use url::Url;

use crate::{connection::ConnectionManager, queue::OutboundQueue};

/// Sender tag on user-authored envelopes.
const USER_SENDER: &str = "user";

/// The live session, its bound agent, and the endpoint that agent lives at.
#[derive(Debug)]
pub struct SessionState {
    session: Session,
    base_url: Url,
    endpoint: Endpoint,
    feed: Arc<StatusFeed>,
}

impl SessionState {
    /// Create the session for `agent_id`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if no valid endpoint can be built for the agent.
    pub fn new(base_url: Url, agent_id: &str, feed: Arc<StatusFeed>) -> Result<Self, ConfigError> {
        let endpoint = Endpoint::for_agent(&base_url, agent_id)?;
        let session = Session::new(endpoint.agent_id());
        tracing::info!(
            session_id = %session.id,
            agent_id = %session.bound_agent_id,
            "Session created"
        );
        feed.push(SessionEvent::SessionStarted {
            session_id: session.id,
            agent_id: session.bound_agent_id.clone(),
        });
        Ok(Self {
            session,
            base_url,
            endpoint,
            feed,
        })
    }

    /// Current session snapshot.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Current session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session.id
    }

    /// Agent the session is bound to.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.session.bound_agent_id
    }

    /// Endpoint of the bound agent.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current connection status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.session.status
    }

    /// Watch the connection status without touching the connection manager.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.feed.subscribe_status()
    }

    /// Copy the manager's status into the session record.
    pub const fn sync_status(&mut self, status: SessionStatus) {
        self.session.status = status;
    }

    /// Queue a chat message tagged with this session and agent.
    ///
    /// Returns the envelope id.
    pub fn send(&self, content: impl Into<String>, queue: &mut OutboundQueue) -> Option<String> {
        let envelope = Envelope::outbound(
            EnvelopeKind::Message,
            json!({
                "content": content.into(),
                "session_id": self.session.id,
                "agent_id": self.session.bound_agent_id,
                "sender": USER_SENDER,
            }),
        );
        let id = envelope.id.clone();
        let depth = queue.enqueue(envelope);
        tracing::debug!(session_id = %self.session.id, id = ?id, depth, "Queued message");
        id
    }

    /// Queue a typing indicator for the bound agent.
    pub fn send_typing(&self, queue: &mut OutboundQueue) {
        queue.enqueue(Envelope::outbound(
            EnvelopeKind::Typing,
            json!({
                "session_id": self.session.id,
                "agent_id": self.session.bound_agent_id,
            }),
        ));
    }

    /// Hand the conversation off to `agent_id`.
    ///
    /// Closes the current binding, starts a new session bound to the new
    /// agent and connects to its endpoint. The outbound queue is untouched, so
    /// anything still queued is delivered over the new connection. Returns
    /// `false` if the session is already bound to `agent_id`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if no valid endpoint can be built for the agent;
    /// the current binding is left as it was.
    pub async fn switch_agent(
        &mut self,
        agent_id: &str,
        connection: &mut ConnectionManager,
    ) -> Result<bool, ConfigError> {
        let endpoint = Endpoint::for_agent(&self.base_url, agent_id)?;
        if endpoint.agent_id() == self.session.bound_agent_id {
            tracing::debug!(agent_id, "Already bound to agent; ignoring switch");
            return Ok(false);
        }

        connection.close().await;

        let previous = std::mem::replace(&mut self.session, Session::new(endpoint.agent_id()));
        self.endpoint = endpoint;
        connection.set_session(self.session.id);

        tracing::info!(
            from_session = %previous.id,
            to_session = %self.session.id,
            from_agent = %previous.bound_agent_id,
            to_agent = %self.session.bound_agent_id,
            "Handing off session"
        );
        self.feed.push(SessionEvent::Handoff {
            from_session: previous.id,
            to_session: self.session.id,
            from_agent: previous.bound_agent_id,
            to_agent: self.session.bound_agent_id.clone(),
        });

        connection.connect(self.endpoint.clone()).await;
        self.session.status = connection.status();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use agentwire_core::payload::ChatPayload;

    use super::*;

    fn state(agent: &str) -> SessionState {
        let base = Url::parse("ws://localhost:8000/ws").unwrap();
        SessionState::new(base, agent, Arc::new(StatusFeed::default())).unwrap()
    }

    #[test]
    fn test_send_tags_session_and_agent() {
        let state = state("router");
        let mut queue = OutboundQueue::new();
        let id = state.send("hello", &mut queue);

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        let envelope = &pending[0].envelope;
        assert_eq!(envelope.kind, EnvelopeKind::Message);
        assert_eq!(envelope.id, id);

        let chat: ChatPayload = envelope.payload_as().unwrap();
        assert_eq!(chat.content, "hello");
        assert_eq!(chat.sender.as_deref(), Some("user"));
        assert_eq!(chat.agent_id.as_deref(), Some("router"));
        assert_eq!(chat.session_id, Some(state.id().to_string()));
    }

    #[test]
    fn test_send_typing_enqueues_typing_envelope() {
        let state = state("router");
        let mut queue = OutboundQueue::new();
        state.send_typing(&mut queue);
        assert_eq!(queue.pending()[0].envelope.kind, EnvelopeKind::Typing);
    }

    #[test]
    fn test_new_session_is_announced() {
        let feed = Arc::new(StatusFeed::default());
        let base = Url::parse("ws://localhost:8000/ws").unwrap();
        let state = SessionState::new(base, "research", Arc::clone(&feed)).unwrap();

        assert_eq!(state.endpoint().url().as_str(), "ws://localhost:8000/ws/research");
        assert_eq!(
            feed.history(),
            vec![SessionEvent::SessionStarted {
                session_id: state.id(),
                agent_id: "research".into(),
            }]
        );
    }

    #[test]
    fn test_debug_includes_session_and_feed() {
        let state = state("router");
        let debug = format!("{state:?}");
        assert!(debug.contains("router"), "{debug}");
        assert!(debug.contains("StatusFeed"), "{debug}");
    }

    #[test]
    fn test_rejects_empty_agent() {
        let base = Url::parse("ws://localhost:8000/ws").unwrap();
        let result = SessionState::new(base, "  ", Arc::new(StatusFeed::default()));
        assert!(matches!(result, Err(ConfigError::EmptyAgentId)));
    }
}
