//! Broadcast + history feed of session events.

use std::{
    collections::VecDeque,
    fmt,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::session::{SessionId, SessionStatus};

/// Default number of events kept for late subscribers.
const DEFAULT_HISTORY: usize = 256;

/// Live channel capacity. Slow subscribers skip ahead rather than block.
const CHANNEL_CAPACITY: usize = 1024;

/// Something observable happened to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session was created and bound to an agent.
    SessionStarted {
        session_id: SessionId,
        agent_id: String,
    },
    /// The connection status changed.
    StatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        attempt: u32,
    },
    /// A reconnect timer was armed.
    ReconnectScheduled {
        session_id: SessionId,
        attempt: u32,
        delay_ms: u64,
    },
    /// The conversation was rebound to another agent.
    Handoff {
        from_session: SessionId,
        to_session: SessionId,
        from_agent: String,
        to_agent: String,
    },
    /// Reconnect attempts exhausted. Blocking until the caller reconnects.
    Fatal { session_id: SessionId, attempts: u32 },
}

struct Inner {
    history: VecDeque<SessionEvent>,
    limit: usize,
}

/// Event feed owned by one client.
///
/// New subscribers receive history and then switch to live events. The
/// current status is carried separately on a watch channel so renderers can
/// always read the latest value.
pub struct StatusFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
}

impl fmt::Debug for StatusFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StatusFeed")
            .field("status", &self.status())
            .field("history", &inner.history.len())
            .field("limit", &inner.limit)
            .finish_non_exhaustive()
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl StatusFeed {
    /// Create a feed keeping at most `history_limit` events.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(history_limit.min(32)),
                limit: history_limit,
            }),
            sender,
            status,
        }
    }

    /// Publish an event to live subscribers and history.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone());

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.limit == 0 {
            return;
        }
        while inner.history.len() >= inner.limit {
            inner.history.pop_front();
        }
        inner.history.push_back(event);
    }

    /// Publish the current status.
    pub fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch the status.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Receiver for live events only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Session event subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}
