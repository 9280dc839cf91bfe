//! Connection manager.
//!
//! The only owner of the transport link. Callers and transport callbacks feed
//! inputs into the [`ConnectionMachine`]; the manager executes the effects it
//! returns. Work that has to wait (opening the link, reading frames, timers)
//! runs in small tasks that post generation-tagged [`LinkEvent`]s back to the
//! driver, which hands them to [`ConnectionManager::handle`] one at a time.

use std::{fmt, sync::Arc, time::Duration};

use agentwire_core::{
    ConnectionError, Endpoint, Envelope, EnvelopeKind, InboundFrame, ReconnectPolicy, SendFailure,
    SessionEvent, SessionId, SessionStatus, StatusFeed, Transport, TransportLink,
    traits::FrameSink,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
    machine::{ConnectionMachine, Effect, Input, Transition},
    queue::OutboundSink,
    timer::ScheduledTask,
};

/// Receiver side of the manager's internal event channel.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Event posted by a transport or timer task.
pub enum LinkEvent {
    /// The transport finished opening.
    Opened { generation: u64, link: TransportLink },
    /// The transport failed to open.
    OpenFailed {
        generation: u64,
        error: ConnectionError,
    },
    /// No `Opened` within the connect timeout.
    ConnectTimedOut { generation: u64 },
    /// One inbound text frame.
    Frame { generation: u64, text: String },
    /// The link errored or was closed by the peer.
    Dropped {
        generation: u64,
        error: ConnectionError,
    },
    /// The reconnect timer fired.
    ReconnectDue { generation: u64 },
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { generation, .. } => f
                .debug_struct("Opened")
                .field("generation", generation)
                .finish_non_exhaustive(),
            Self::OpenFailed { generation, error } => f
                .debug_struct("OpenFailed")
                .field("generation", generation)
                .field("error", error)
                .finish(),
            Self::ConnectTimedOut { generation } => f
                .debug_struct("ConnectTimedOut")
                .field("generation", generation)
                .finish(),
            Self::Frame { generation, text } => f
                .debug_struct("Frame")
                .field("generation", generation)
                .field("len", &text.len())
                .finish(),
            Self::Dropped { generation, error } => f
                .debug_struct("Dropped")
                .field("generation", generation)
                .field("error", error)
                .finish(),
            Self::ReconnectDue { generation } => f
                .debug_struct("ReconnectDue")
                .field("generation", generation)
                .finish(),
        }
    }
}

/// What the driver has to do after the manager handled an event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// The link just opened: drain the outbound queue.
    pub flush: bool,
    /// Inbound frame to validate and dispatch.
    pub inbound: Option<String>,
    /// Reconnect attempts were exhausted.
    pub fatal: bool,
}

/// Manager tuning.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub policy: ReconnectPolicy,
    pub connect_timeout: Option<Duration>,
}

struct ActiveLink {
    generation: u64,
    sink: Box<dyn FrameSink>,
    reader: JoinHandle<()>,
}

/// Owns the transport lifecycle and the reconnection state machine.
pub struct ConnectionManager {
    machine: ConnectionMachine,
    transport: Arc<dyn Transport>,
    feed: Arc<StatusFeed>,
    events: mpsc::UnboundedSender<LinkEvent>,
    connect_timeout: Option<Duration>,
    session_id: SessionId,
    endpoint: Option<Endpoint>,
    /// Bumped on every open and teardown; tags link and connect-timeout events.
    link_generation: u64,
    /// Bumped on every schedule and cancel; tags reconnect timer events.
    timer_generation: u64,
    link: Option<ActiveLink>,
    pending_open: Option<JoinHandle<()>>,
    /// Opens abandoned by a close or a newer attempt. They run to completion
    /// and report under their old generation.
    superseded_opens: Vec<JoinHandle<()>>,
    connect_deadline: Option<ScheduledTask>,
    reconnect_timer: Option<ScheduledTask>,
}

impl ConnectionManager {
    /// Create an idle manager and the channel its tasks report on.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        feed: Arc<StatusFeed>,
    ) -> (Self, LinkEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            machine: ConnectionMachine::new(options.policy),
            transport,
            feed,
            events,
            connect_timeout: options.connect_timeout,
            session_id: Uuid::nil(),
            endpoint: None,
            link_generation: 0,
            timer_generation: 0,
            link: None,
            pending_open: None,
            superseded_opens: Vec::new(),
            connect_deadline: None,
            reconnect_timer: None,
        };
        (manager, rx)
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.machine.status()
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.machine.attempts()
    }

    /// Tag subsequent status events with `session_id`.
    pub const fn set_session(&mut self, session_id: SessionId) {
        self.session_id = session_id;
    }

    /// Connect to `endpoint`. A no-op while already connecting or open.
    pub async fn connect(&mut self, endpoint: Endpoint) -> Outcome {
        let transition = self.machine.apply(Input::Connect);
        if transition.is_noop() {
            tracing::info!(
                status = %self.status(),
                endpoint = %endpoint,
                "Ignoring connect: already connecting or open"
            );
            return Outcome::default();
        }
        self.endpoint = Some(endpoint);
        self.run(transition).await
    }

    /// Caller-initiated close. Never triggers reconnection.
    pub async fn close(&mut self) -> Outcome {
        let transition = self.machine.apply(Input::Close);
        if transition.is_noop() {
            tracing::debug!(status = %self.status(), "Ignoring close: already terminal");
            return Outcome::default();
        }
        self.run(transition).await
    }

    /// Handle one event posted by a transport or timer task.
    pub async fn handle(&mut self, event: LinkEvent) -> Outcome {
        match event {
            LinkEvent::Opened { generation, link } => {
                if generation != self.link_generation || self.status() != SessionStatus::Connecting
                {
                    tracing::debug!(generation, "Discarding stale transport link");
                    let mut sink = link.sink;
                    tokio::spawn(async move {
                        let _ = sink.close().await;
                    });
                    return Outcome::default();
                }
                self.pending_open = None;
                self.connect_deadline = None;
                self.attach(generation, link);
                let transition = self.machine.apply(Input::Opened);
                self.run(transition).await
            }
            LinkEvent::OpenFailed { generation, error } => {
                if generation != self.link_generation {
                    return Outcome::default();
                }
                tracing::warn!(endpoint = ?self.endpoint_url(), "Transport open failed: {error}");
                self.drop_link().await
            }
            LinkEvent::ConnectTimedOut { generation } => {
                if generation != self.link_generation || self.status() != SessionStatus::Connecting
                {
                    return Outcome::default();
                }
                let error = ConnectionError::Timeout(self.connect_timeout.unwrap_or_default());
                tracing::warn!(endpoint = ?self.endpoint_url(), "{error}");
                self.drop_link().await
            }
            LinkEvent::Frame { generation, text } => {
                if generation != self.link_generation || self.status() != SessionStatus::Open {
                    tracing::debug!(generation, "Discarding frame from stale link");
                    return Outcome::default();
                }
                Outcome {
                    inbound: Some(text),
                    ..Outcome::default()
                }
            }
            LinkEvent::Dropped { generation, error } => {
                if generation != self.link_generation {
                    return Outcome::default();
                }
                tracing::warn!(endpoint = ?self.endpoint_url(), "Transport dropped: {error}");
                self.drop_link().await
            }
            LinkEvent::ReconnectDue { generation } => {
                let current = self
                    .reconnect_timer
                    .as_ref()
                    .is_some_and(|t| t.generation() == generation);
                if !current {
                    tracing::debug!(generation, "Discarding cancelled reconnect timer");
                    return Outcome::default();
                }
                self.reconnect_timer = None;
                let transition = self.machine.apply(Input::TimerFired);
                self.run(transition).await
            }
        }
    }

    /// Send a keepalive ping if the link is open.
    pub async fn keepalive(&mut self) {
        if self.status() != SessionStatus::Open {
            return;
        }
        let ping = Envelope::outbound(EnvelopeKind::Ping, serde_json::json!({}));
        if let Err(e) = self.transmit_envelope(&ping).await {
            tracing::debug!("Keepalive failed: {e}");
        }
    }

    /// Write one envelope to the open link.
    ///
    /// A write failure tears the link down and runs the reconnect path.
    ///
    /// # Errors
    /// Returns [`SendFailure`] if there is no open link or the write fails.
    pub async fn transmit_envelope(&mut self, envelope: &Envelope) -> Result<(), SendFailure> {
        let not_open = || SendFailure::new(envelope.id.clone(), ConnectionError::NotOpen);
        if self.status() != SessionStatus::Open {
            return Err(not_open());
        }
        let Some(link) = self.link.as_mut() else {
            return Err(not_open());
        };

        let text = envelope.to_text().map_err(|e| {
            SendFailure::new(envelope.id.clone(), ConnectionError::Write(e.to_string()))
        })?;

        match link.sink.send(text).await {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::warn!(id = ?envelope.id, "Transmit failed: {error}");
                self.drop_link().await;
                Err(SendFailure::new(envelope.id.clone(), error))
            }
        }
    }

    async fn drop_link(&mut self) -> Outcome {
        let transition = self.machine.apply(Input::Dropped);
        self.run(transition).await
    }

    fn endpoint_url(&self) -> Option<&str> {
        self.endpoint.as_ref().map(|e| e.url().as_str())
    }

    /// Carry out a transition's effects and publish the status change.
    async fn run(&mut self, transition: Transition) -> Outcome {
        let mut outcome = Outcome::default();

        for effect in &transition.effects {
            match effect {
                Effect::CancelReconnect => self.cancel_reconnect(),
                Effect::OpenTransport => self.open_transport(),
                Effect::CloseTransport => self.close_transport().await,
                Effect::ScheduleReconnect { attempt, delay } => {
                    self.schedule_reconnect(*attempt, *delay);
                }
                Effect::FlushQueue => outcome.flush = true,
                Effect::Fatal { attempts } => {
                    self.feed.push(SessionEvent::Fatal {
                        session_id: self.session_id,
                        attempts: *attempts,
                    });
                    outcome.fatal = true;
                }
            }
        }

        if transition.from != transition.to {
            tracing::info!(
                session_id = %self.session_id,
                from = %transition.from,
                to = %transition.to,
                attempt = transition.attempts,
                "Connection status changed"
            );
            self.feed.set_status(transition.to);
            self.feed.push(SessionEvent::StatusChanged {
                session_id: self.session_id,
                from: transition.from,
                to: transition.to,
                attempt: transition.attempts,
            });
        }

        outcome
    }

    fn cancel_reconnect(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            tracing::debug!(delay = ?timer.delay(), "Cancelled reconnect timer");
            timer.cancel();
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32, delay: Duration) {
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            session_id = %self.session_id,
            attempt,
            delay_ms,
            "Scheduling reconnect"
        );
        self.reconnect_timer = Some(ScheduledTask::schedule(
            delay,
            generation,
            self.events.clone(),
            LinkEvent::ReconnectDue { generation },
        ));
        self.feed.push(SessionEvent::ReconnectScheduled {
            session_id: self.session_id,
            attempt,
            delay_ms,
        });
    }

    fn open_transport(&mut self) {
        self.link_generation += 1;
        let generation = self.link_generation;

        let Some(endpoint) = self.endpoint.clone() else {
            tracing::error!("OpenTransport without an endpoint");
            let _ = self.events.send(LinkEvent::OpenFailed {
                generation,
                error: ConnectionError::Open("no endpoint".into()),
            });
            return;
        };

        tracing::debug!(endpoint = %endpoint, generation, "Opening transport");
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        self.pending_open = Some(tokio::spawn(async move {
            let event = match transport.open(endpoint.url()).await {
                Ok(link) => LinkEvent::Opened { generation, link },
                Err(error) => LinkEvent::OpenFailed { generation, error },
            };
            let _ = events.send(event);
        }));

        self.connect_deadline = self.connect_timeout.map(|timeout| {
            ScheduledTask::schedule(
                timeout,
                generation,
                self.events.clone(),
                LinkEvent::ConnectTimedOut { generation },
            )
        });
    }

    async fn close_transport(&mut self) {
        self.link_generation += 1;
        if let Some(pending) = self.pending_open.take() {
            self.superseded_opens.retain(|open| !open.is_finished());
            self.superseded_opens.push(pending);
        }
        self.connect_deadline = None;

        if let Some(mut link) = self.link.take() {
            link.reader.abort();
            if let Err(e) = link.sink.close().await {
                tracing::debug!(generation = link.generation, "Error closing transport: {e}");
            }
        }
    }

    fn attach(&mut self, generation: u64, link: TransportLink) {
        let TransportLink { sink, mut frames } = link;
        let events = self.events.clone();

        let reader = tokio::spawn(async move {
            while let Some(item) = frames.next().await {
                let event = match item {
                    Ok(InboundFrame::Text(text)) => LinkEvent::Frame { generation, text },
                    Ok(InboundFrame::Closed { code, reason }) => LinkEvent::Dropped {
                        generation,
                        error: ConnectionError::ClosedByPeer { code, reason },
                    },
                    Err(error) => LinkEvent::Dropped { generation, error },
                };
                let terminal = matches!(event, LinkEvent::Dropped { .. });
                if events.send(event).is_err() || terminal {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Dropped {
                generation,
                error: ConnectionError::StreamEnded,
            });
        });

        self.link = Some(ActiveLink {
            generation,
            sink,
            reader,
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(pending) = self.pending_open.take() {
            pending.abort();
        }
        for open in self.superseded_opens.drain(..) {
            open.abort();
        }
        if let Some(link) = self.link.take() {
            link.reader.abort();
        }
    }
}

#[async_trait]
impl OutboundSink for ConnectionManager {
    async fn transmit(&mut self, envelope: &Envelope) -> Result<(), SendFailure> {
        self.transmit_envelope(envelope).await
    }
}
