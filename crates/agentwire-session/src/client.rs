//! Session client.
//!
//! [`SessionClient::spawn`] starts one driver task that owns the connection
//! manager, outbound queue, router and session state. The returned handle is
//! cheap to clone; every call is a command processed by the driver in order,
//! interleaved with transport and timer events. Nothing else touches the
//! transport.

use std::{sync::Arc, time::Duration};

use agentwire_core::{
    ClientConfig, ClientError, ConfigError, Envelope, EnvelopeKind, Session, SessionEvent,
    SessionStatus, StatusFeed, Transport, payload::HandoffPayload,
};
use futures::stream::BoxStream;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};

use crate::{
    connection::{ConnectionManager, ConnectionOptions, LinkEvents, Outcome},
    queue::OutboundQueue,
    router::{EventRouter, RouterStats},
    state::SessionState,
};

enum Command {
    Connect(oneshot::Sender<SessionStatus>),
    Close(oneshot::Sender<()>),
    Send {
        content: String,
        reply: oneshot::Sender<Option<String>>,
    },
    SendTyping(oneshot::Sender<()>),
    Enqueue {
        envelope: Envelope,
        reply: oneshot::Sender<usize>,
    },
    SwitchAgent {
        agent_id: String,
        reply: oneshot::Sender<Result<bool, ConfigError>>,
    },
    Session(oneshot::Sender<Session>),
    QueueLen(oneshot::Sender<usize>),
    Stats(oneshot::Sender<RouterStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session driver.
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::UnboundedSender<Command>,
    feed: Arc<StatusFeed>,
    max_attempts: u32,
}

impl SessionClient {
    /// Validate `config`, create the session and spawn its driver.
    ///
    /// The client starts `Idle`; call [`connect`](Self::connect) to open the
    /// channel. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`ClientError::Config`] if the configuration is invalid.
    pub fn spawn(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        router: EventRouter,
    ) -> Result<(Self, JoinHandle<()>), ClientError> {
        config.validate()?;

        let feed = Arc::new(StatusFeed::new(config.event_history));
        let state = SessionState::new(config.base_url()?, &config.agent_id, Arc::clone(&feed))?;

        let options = ConnectionOptions {
            policy: config.reconnect.clone(),
            connect_timeout: config.connect_timeout(),
        };
        let (mut connection, events) =
            ConnectionManager::new(transport, options, Arc::clone(&feed));
        connection.set_session(state.id());

        let driver = Driver {
            connection,
            queue: OutboundQueue::new(),
            router,
            state,
            follow_handoffs: config.follow_handoffs,
        };

        let (commands, rx) = mpsc::unbounded_channel();
        let keepalive = config.keepalive_interval();
        let handle = tokio::spawn(driver.run(rx, events, keepalive));

        Ok((
            Self {
                commands,
                feed,
                max_attempts: config.reconnect.max_attempts,
            },
            handle,
        ))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Connect to the bound agent. Also the way out of `Failed`.
    ///
    /// Returns the status once the attempt has started; use
    /// [`wait_until_open`](Self::wait_until_open) to wait for the result.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn connect(&self) -> Result<SessionStatus, ClientError> {
        self.request(Command::Connect).await
    }

    /// Close the channel. No reconnection follows.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.request(Command::Close).await
    }

    /// Queue a chat message. It is sent now if the channel is open, otherwise
    /// once it opens. Returns the envelope id.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn send(&self, content: impl Into<String>) -> Result<Option<String>, ClientError> {
        let content = content.into();
        self.request(|reply| Command::Send { content, reply }).await
    }

    /// Queue a typing indicator.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn send_typing(&self) -> Result<(), ClientError> {
        self.request(Command::SendTyping).await
    }

    /// Queue an arbitrary envelope. Returns the queue depth after enqueueing.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<usize, ClientError> {
        self.request(|reply| Command::Enqueue { envelope, reply })
            .await
    }

    /// Hand the conversation off to another agent. Queued messages are kept
    /// and delivered over the new connection. Returns `false` if already
    /// bound to `agent_id`.
    ///
    /// # Errors
    /// Returns [`ClientError::Config`] for an invalid agent id, or
    /// [`ClientError::Stopped`] if the driver has stopped.
    pub async fn switch_agent(&self, agent_id: impl Into<String>) -> Result<bool, ClientError> {
        let agent_id = agent_id.into();
        Ok(self
            .request(|reply| Command::SwitchAgent { agent_id, reply })
            .await??)
    }

    /// Snapshot of the live session.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn session(&self) -> Result<Session, ClientError> {
        self.request(Command::Session).await
    }

    /// Number of messages waiting to be sent.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn queue_len(&self) -> Result<usize, ClientError> {
        self.request(Command::QueueLen).await
    }

    /// Inbound dispatch counters.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has stopped.
    pub async fn router_stats(&self) -> Result<RouterStats, ClientError> {
        self.request(Command::Stats).await
    }

    /// Latest connection status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.feed.status()
    }

    /// Watch the connection status.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.feed.subscribe_status()
    }

    /// Session events: retained history first, then live events.
    #[must_use]
    pub fn subscribe_events(&self) -> BoxStream<'static, SessionEvent> {
        self.feed.history_plus_stream()
    }

    /// Retained session events.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.feed.history()
    }

    /// Wait until the status equals `target`.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the status feed is gone.
    pub async fn wait_for_status(&self, target: SessionStatus) -> Result<(), ClientError> {
        let mut rx = self.feed.subscribe_status();
        rx.wait_for(|status| *status == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    /// Wait until the channel is open.
    ///
    /// Waits indefinitely while `Idle`.
    ///
    /// # Errors
    /// Returns [`ClientError::ReconnectExhausted`] if the session fails,
    /// [`ClientError::Closed`] if it is closed first.
    pub async fn wait_until_open(&self) -> Result<(), ClientError> {
        let mut rx = self.feed.subscribe_status();
        let status = *rx
            .wait_for(|status| *status == SessionStatus::Open || status.is_terminal())
            .await
            .map_err(|_| ClientError::Stopped)?;

        match status {
            SessionStatus::Failed => Err(ClientError::ReconnectExhausted {
                attempts: self.max_attempts,
            }),
            SessionStatus::Closed => Err(ClientError::Closed),
            _ => Ok(()),
        }
    }

    /// Close the channel and stop the driver.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver had already stopped.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(Command::Shutdown).await
    }
}

struct Driver {
    connection: ConnectionManager,
    queue: OutboundQueue,
    router: EventRouter,
    state: SessionState,
    follow_handoffs: bool,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: LinkEvents,
        keepalive: Option<Duration>,
    ) {
        let mut keepalive = keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tracing::debug!(session_id = %self.state.id(), "Session driver started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if let Some(done) = self.command(command).await {
                        self.stop().await;
                        let _ = done.send(());
                        return;
                    }
                }
                Some(event) = events.recv() => {
                    let outcome = self.connection.handle(event).await;
                    self.apply(outcome).await;
                }
                () = tick(keepalive.as_mut()) => {
                    self.connection.keepalive().await;
                    self.sync();
                }
            }
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        let outcome = self.connection.close().await;
        self.apply(outcome).await;
        tracing::info!(session_id = %self.state.id(), "Session driver stopped");
    }

    /// Returns the shutdown acknowledgement when the driver should stop.
    async fn command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Connect(reply) => {
                let endpoint = self.state.endpoint().clone();
                let outcome = self.connection.connect(endpoint).await;
                self.apply(outcome).await;
                let _ = reply.send(self.connection.status());
            }
            Command::Close(reply) => {
                let outcome = self.connection.close().await;
                self.apply(outcome).await;
                let _ = reply.send(());
            }
            Command::Send { content, reply } => {
                let id = self.state.send(content, &mut self.queue);
                self.flush().await;
                let _ = reply.send(id);
            }
            Command::SendTyping(reply) => {
                self.state.send_typing(&mut self.queue);
                self.flush().await;
                let _ = reply.send(());
            }
            Command::Enqueue { envelope, reply } => {
                self.queue.enqueue(envelope);
                self.flush().await;
                let _ = reply.send(self.queue.len());
            }
            Command::SwitchAgent { agent_id, reply } => {
                let result = self.switch_agent(&agent_id).await;
                let _ = reply.send(result);
            }
            Command::Session(reply) => {
                self.sync();
                let _ = reply.send(self.state.session().clone());
            }
            Command::QueueLen(reply) => {
                let _ = reply.send(self.queue.len());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.router.stats());
            }
            Command::Shutdown(reply) => return Some(reply),
        }
        None
    }

    async fn apply(&mut self, outcome: Outcome) {
        self.sync();
        if outcome.fatal {
            tracing::error!(
                session_id = %self.state.id(),
                attempts = self.connection.attempts(),
                "Reconnect attempts exhausted; waiting for an explicit connect"
            );
        }
        if let Some(text) = outcome.inbound {
            self.inbound(&text).await;
        }
        if outcome.flush {
            self.flush().await;
        }
    }

    fn sync(&mut self) {
        self.state.sync_status(self.connection.status());
    }

    async fn flush(&mut self) {
        if self.connection.status() != SessionStatus::Open || self.queue.is_empty() {
            return;
        }
        let report = self.queue.flush(&mut self.connection).await;
        if report.halted() {
            tracing::info!(
                delivered = report.delivered,
                remaining = report.remaining,
                "Outbound flush interrupted; remaining messages stay queued"
            );
        }
        self.sync();
    }

    async fn inbound(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.router.reject(&error);
                return;
            }
        };

        self.router.dispatch(&envelope);

        if self.follow_handoffs && envelope.kind == EnvelopeKind::Handoff {
            match envelope.payload_as::<HandoffPayload>() {
                Ok(handoff) => {
                    if let Err(e) = self.switch_agent(&handoff.to_agent_id).await {
                        tracing::warn!(
                            to_agent = %handoff.to_agent_id,
                            "Cannot follow handoff: {e}"
                        );
                    }
                }
                Err(e) => tracing::warn!("Ignoring handoff: {e}"),
            }
        }
    }

    async fn switch_agent(&mut self, agent_id: &str) -> Result<bool, ConfigError> {
        let switched = self
            .state
            .switch_agent(agent_id, &mut self.connection)
            .await?;
        self.sync();
        Ok(switched)
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use agentwire_core::{
        ConnectionError, Consumer, HandlerError, InboundFrame, ReconnectPolicy, TransportLink,
        traits::FrameSink,
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use url::Url;

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum OpenScript {
        Accept,
        Refuse,
        Hang,
        /// Accept after the given number of milliseconds.
        Delay(u64),
    }

    type PeerTx = mpsc::UnboundedSender<Result<InboundFrame, ConnectionError>>;

    #[derive(Default)]
    struct Shared {
        script: VecDeque<OpenScript>,
        opens: Vec<(Url, Instant)>,
        sent: Vec<String>,
        send_calls: usize,
        fail_sends: Vec<usize>,
        peers: Vec<PeerTx>,
        closed_links: usize,
    }

    /// Scripted in-memory transport. Opens succeed unless scripted otherwise.
    #[derive(Clone, Default)]
    struct MockTransport {
        shared: Arc<Mutex<Shared>>,
    }

    impl MockTransport {
        fn script(&self, outcomes: impl IntoIterator<Item = OpenScript>) {
            self.shared.lock().unwrap().script.extend(outcomes);
        }

        /// Fail the given send call (1-based, counted across all links).
        fn fail_send(&self, call: usize) {
            self.shared.lock().unwrap().fail_sends.push(call);
        }

        fn opens(&self) -> Vec<(Url, Instant)> {
            self.shared.lock().unwrap().opens.clone()
        }

        fn open_offsets_ms(&self, start: Instant) -> Vec<u128> {
            self.opens()
                .iter()
                .map(|(_, at)| at.duration_since(start).as_millis())
                .collect()
        }

        fn sent(&self) -> Vec<Envelope> {
            self.shared
                .lock()
                .unwrap()
                .sent
                .iter()
                .map(|text| Envelope::parse(text).unwrap())
                .collect()
        }

        fn sent_contents(&self) -> Vec<String> {
            self.sent()
                .iter()
                .filter(|e| e.kind == EnvelopeKind::Message)
                .map(|e| e.payload_str("content").unwrap().to_string())
                .collect()
        }

        fn closed_links(&self) -> usize {
            self.shared.lock().unwrap().closed_links
        }

        /// Links whose frame stream is still being read.
        fn live_links(&self) -> usize {
            self.shared
                .lock()
                .unwrap()
                .peers
                .iter()
                .filter(|peer| !peer.is_closed())
                .count()
        }

        fn peer(&self) -> PeerTx {
            self.shared.lock().unwrap().peers.last().unwrap().clone()
        }

        fn push_frame(&self, text: impl Into<String>) {
            self.peer().send(Ok(InboundFrame::Text(text.into()))).unwrap();
        }

        fn reset_link(&self) {
            self.peer()
                .send(Err(ConnectionError::Read("connection reset".into())))
                .unwrap();
        }

        fn accept(&self) -> TransportLink {
            let (tx, rx) = mpsc::unbounded_channel();
            self.shared.lock().unwrap().peers.push(tx);
            let frames = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed();
            TransportLink::new(
                MockSink {
                    shared: Arc::clone(&self.shared),
                },
                frames,
            )
        }

        fn close_from_server(&self, code: u16) {
            self.peer()
                .send(Ok(InboundFrame::Closed {
                    code: Some(code),
                    reason: "bye".into(),
                }))
                .unwrap();
        }
    }

    struct MockSink {
        shared: Arc<Mutex<Shared>>,
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
            let mut shared = self.shared.lock().unwrap();
            shared.send_calls += 1;
            let call = shared.send_calls;
            if shared.fail_sends.contains(&call) {
                return Err(ConnectionError::Write("broken pipe".into()));
            }
            shared.sent.push(text);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            // Closing a real socket takes a round trip.
            tokio::task::yield_now().await;
            self.shared.lock().unwrap().closed_links += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self, url: &Url) -> Result<TransportLink, ConnectionError> {
            let outcome = {
                let mut shared = self.shared.lock().unwrap();
                shared.opens.push((url.clone(), Instant::now()));
                shared.script.pop_front().unwrap_or(OpenScript::Accept)
            };
            match outcome {
                OpenScript::Refuse => Err(ConnectionError::Open("connection refused".into())),
                OpenScript::Hang => std::future::pending().await,
                OpenScript::Delay(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(self.accept())
                }
                OpenScript::Accept => Ok(self.accept()),
            }
        }
    }

    fn config(agent: &str) -> ClientConfig {
        let mut config = ClientConfig::new("ws://agents.test/ws", agent);
        config.reconnect = ReconnectPolicy::new(3, Duration::from_millis(1000), 2.0);
        config
    }

    fn spawn_with(
        config: &ClientConfig,
        transport: &MockTransport,
        router: EventRouter,
    ) -> SessionClient {
        let transport: Arc<dyn Transport> = Arc::new(transport.clone());
        SessionClient::spawn(config, transport, router).unwrap().0
    }

    fn spawn(config: &ClientConfig, transport: &MockTransport) -> SessionClient {
        spawn_with(config, transport, EventRouter::new())
    }

    fn reconnects(client: &SessionClient) -> Vec<(u32, u64)> {
        client
            .history()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::ReconnectScheduled {
                    attempt, delay_ms, ..
                } => Some((attempt, delay_ms)),
                _ => None,
            })
            .collect()
    }

    fn open_transitions(client: &SessionClient) -> usize {
        client
            .history()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    SessionEvent::StatusChanged {
                        to: SessionStatus::Open,
                        ..
                    }
                )
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_until_failed() {
        let transport = MockTransport::default();
        transport.script([OpenScript::Refuse; 4]);
        let client = spawn(&config("alpha"), &transport);

        let start = Instant::now();
        client.connect().await.unwrap();
        let err = client.wait_until_open().await.unwrap_err();

        assert!(matches!(err, ClientError::ReconnectExhausted { attempts: 3 }));
        assert_eq!(transport.open_offsets_ms(start), vec![0, 1000, 3000, 7000]);
        assert_eq!(reconnects(&client), vec![(1, 1000), (2, 2000), (3, 4000)]);
        assert!(
            client
                .history()
                .iter()
                .any(|e| matches!(e, SessionEvent::Fatal { attempts: 3, .. }))
        );

        // Nothing else is scheduled.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens().len(), 4);
        assert_eq!(client.status(), SessionStatus::Failed);

        // A fresh connect recovers with a reset counter.
        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        assert_eq!(transport.opens().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_reconnecting_cancels_timer() {
        let transport = MockTransport::default();
        transport.script([OpenScript::Refuse]);
        let client = spawn(&config("alpha"), &transport);

        client.connect().await.unwrap();
        client
            .wait_for_status(SessionStatus::Reconnecting)
            .await
            .unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.wait_until_open().await, Err(ClientError::Closed)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.status(), SessionStatus::Closed);
        assert_eq!(transport.opens().len(), 1);

        let after_close: Vec<_> = client
            .history()
            .into_iter()
            .skip_while(|e| {
                !matches!(
                    e,
                    SessionEvent::StatusChanged {
                        to: SessionStatus::Closed,
                        ..
                    }
                )
            })
            .skip(1)
            .collect();
        assert!(after_close.is_empty(), "unexpected events {after_close:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_reconnecting_opens_immediately() {
        let transport = MockTransport::default();
        transport.script([OpenScript::Refuse]);
        let client = spawn(&config("alpha"), &transport);

        let start = Instant::now();
        client.connect().await.unwrap();
        client
            .wait_for_status(SessionStatus::Reconnecting)
            .await
            .unwrap();
        assert_eq!(client.connect().await.unwrap(), SessionStatus::Connecting);
        client.wait_until_open().await.unwrap();

        // The cancelled timer must not start a second attempt.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_offsets_ms(start), vec![0, 0]);
        assert_eq!(open_transitions(&client), 1);
        assert_eq!(transport.live_links(), 1);
        assert_eq!(client.status(), SessionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_open_from_superseded_attempt_is_discarded() {
        let transport = MockTransport::default();
        // The abandoned attempt finishes first, while the new one is pending.
        transport.script([OpenScript::Delay(500), OpenScript::Delay(1000)]);
        let client = spawn(&config("alpha"), &transport);

        let start = Instant::now();
        client.send("hello").await.unwrap();
        client.connect().await.unwrap();
        client.close().await.unwrap();
        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.open_offsets_ms(start), vec![0, 0]);
        assert_eq!(open_transitions(&client), 1);
        assert_eq!(transport.live_links(), 1);
        assert_eq!(transport.closed_links(), 1);
        assert_eq!(transport.sent_contents(), vec!["hello"]);
        assert_eq!(client.status(), SessionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_flush_in_order_on_open() {
        let transport = MockTransport::default();
        let client = spawn(&config("alpha"), &transport);

        for content in ["one", "two", "three"] {
            client.send(content).await.unwrap();
        }
        assert_eq!(client.queue_len().await.unwrap(), 3);
        assert!(transport.sent().is_empty());

        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        assert_eq!(client.queue_len().await.unwrap(), 0);
        assert_eq!(transport.sent_contents(), vec!["one", "two", "three"]);

        client.send("four").await.unwrap();
        assert_eq!(transport.sent_contents(), vec!["one", "two", "three", "four"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_keeps_order_and_resets_backoff() {
        let transport = MockTransport::default();
        let client = spawn(&config("alpha"), &transport);

        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        client.send("a").await.unwrap();

        transport.reset_link();
        client
            .wait_for_status(SessionStatus::Reconnecting)
            .await
            .unwrap();
        client.send("b").await.unwrap();
        client.send("c").await.unwrap();
        assert_eq!(client.queue_len().await.unwrap(), 2);

        client.wait_until_open().await.unwrap();
        assert_eq!(client.queue_len().await.unwrap(), 0);
        assert_eq!(transport.sent_contents(), vec!["a", "b", "c"]);

        // A normal close code from the server still counts as unexpected, and
        // backoff starts over from the first attempt.
        transport.close_from_server(1000);
        client
            .wait_for_status(SessionStatus::Reconnecting)
            .await
            .unwrap();
        client.wait_until_open().await.unwrap();
        assert_eq!(reconnects(&client), vec![(1, 1000), (1, 1000)]);
        assert_eq!(client.session().await.unwrap().status, SessionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_requeues_and_reconnects() {
        let transport = MockTransport::default();
        transport.fail_send(2);
        let client = spawn(&config("alpha"), &transport);

        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        client.send("a").await.unwrap();
        client.send("b").await.unwrap();

        assert_eq!(client.status(), SessionStatus::Reconnecting);
        assert_eq!(client.queue_len().await.unwrap(), 1);

        client.wait_until_open().await.unwrap();
        assert_eq!(client.queue_len().await.unwrap(), 0);
        assert_eq!(transport.sent_contents(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_agent_keeps_queued_messages_first() {
        let transport = MockTransport::default();
        transport.script([OpenScript::Hang]);
        let client = spawn(&config("alpha"), &transport);

        client.connect().await.unwrap();
        client.send("queued-1").await.unwrap();
        client.send("queued-2").await.unwrap();
        let before = client.session().await.unwrap();

        assert!(client.switch_agent("beta").await.unwrap());
        client.send("after-switch").await.unwrap();
        client.wait_until_open().await.unwrap();

        assert_eq!(
            transport.sent_contents(),
            vec!["queued-1", "queued-2", "after-switch"]
        );
        let urls: Vec<String> = transport
            .opens()
            .iter()
            .map(|(url, _)| url.to_string())
            .collect();
        assert_eq!(
            urls,
            vec!["ws://agents.test/ws/alpha", "ws://agents.test/ws/beta"]
        );

        let after = client.session().await.unwrap();
        assert_ne!(before.id, after.id);
        assert_eq!(after.bound_agent_id, "beta");

        // Queued envelopes keep the binding they were created under.
        let agents: Vec<String> = transport
            .sent()
            .iter()
            .map(|e| e.payload_str("agent_id").unwrap().to_string())
            .collect();
        assert_eq!(agents, vec!["alpha", "alpha", "beta"]);

        assert!(client.history().contains(&SessionEvent::Handoff {
            from_session: before.id,
            to_session: after.id,
            from_agent: "alpha".into(),
            to_agent: "beta".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_bound_agent_is_noop() {
        let transport = MockTransport::default();
        let client = spawn(&config("alpha"), &transport);
        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();

        assert!(!client.switch_agent("alpha").await.unwrap());
        assert!(matches!(
            client.switch_agent("   ").await,
            Err(ClientError::Config(ConfigError::EmptyAgentId))
        ));
        assert_eq!(transport.opens().len(), 1);
        assert_eq!(client.status(), SessionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_handoff_is_followed() {
        let handoffs = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        let seen = Arc::clone(&handoffs);
        router.register_consumer(
            Consumer::Handoff,
            move |envelope: &Envelope| -> Result<(), HandlerError> {
                let handoff: HandoffPayload = envelope.payload_as()?;
                seen.lock().unwrap().push(handoff.to_agent_id);
                Ok(())
            },
        );

        let transport = MockTransport::default();
        let client = spawn_with(&config("alpha"), &transport, router);
        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();

        let mut events = client.subscribe_events();
        transport.push_frame(
            r#"{"type": "handoff", "from_agent_id": "alpha", "to_agent_id": "beta", "to_agent_name": "Beta"}"#,
        );
        loop {
            if let Some(SessionEvent::Handoff { to_agent, .. }) = events.next().await {
                assert_eq!(to_agent, "beta");
                break;
            }
        }
        client.wait_until_open().await.unwrap();

        assert_eq!(*handoffs.lock().unwrap(), vec!["beta"]);
        assert_eq!(client.session().await.unwrap().bound_agent_id, "beta");
        assert_eq!(transport.closed_links(), 1);
        assert_eq!(transport.opens().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_dispatch_survives_bad_frames() {
        let transcript = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        let seen = Arc::clone(&transcript);
        router.register_consumer(
            Consumer::Transcript,
            move |envelope: &Envelope| -> Result<(), HandlerError> {
                seen.lock()
                    .unwrap()
                    .push(envelope.payload_str("content").unwrap_or_default().to_string());
                Ok(())
            },
        );

        let transport = MockTransport::default();
        let client = spawn_with(&config("alpha"), &transport, router);
        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();

        transport.push_frame("{not json");
        transport.push_frame(r#"{"type": "mystery", "payload": {}}"#);
        transport.push_frame(r#"{"type": "agent_message", "content": "hello"}"#);

        let stats = loop {
            let stats = client.router_stats().await.unwrap();
            if stats.malformed + stats.unhandled + stats.handled == 3 {
                break stats;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unhandled, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(*transcript.lock().unwrap(), vec!["hello"]);
        assert_eq!(client.status(), SessionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_error() {
        let mut config = config("alpha");
        config.connect_timeout_ms = Some(5000);
        let transport = MockTransport::default();
        transport.script([OpenScript::Hang]);
        let client = spawn(&config, &transport);

        let start = Instant::now();
        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();

        assert_eq!(transport.open_offsets_ms(start), vec![0, 6000]);
        assert_eq!(reconnects(&client), vec![(1, 1000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_while_open() {
        let mut config = config("alpha");
        config.keepalive_interval_ms = Some(30_000);
        let transport = MockTransport::default();
        let client = spawn(&config, &transport);

        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;

        let kinds: Vec<EnvelopeKind> = transport.sent().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::Ping; 3]);
        assert_eq!(client.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_report_stopped() {
        let transport = MockTransport::default();
        let (client, driver) = SessionClient::spawn(
            &config("alpha"),
            Arc::new(transport.clone()),
            EventRouter::new(),
        )
        .unwrap();

        client.connect().await.unwrap();
        client.wait_until_open().await.unwrap();
        client.shutdown().await.unwrap();
        // The link is closed by the time shutdown returns.
        assert_eq!(client.status(), SessionStatus::Closed);
        assert_eq!(transport.closed_links(), 1);

        driver.await.unwrap();
        assert!(matches!(client.send("late").await, Err(ClientError::Stopped)));
        assert!(matches!(client.shutdown().await, Err(ClientError::Stopped)));
    }

    #[test]
    fn test_spawn_rejects_invalid_config() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let config = ClientConfig::new("http://agents.test/ws", "alpha");
        let result = SessionClient::spawn(
            &config,
            Arc::new(MockTransport::default()),
            EventRouter::new(),
        );
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
