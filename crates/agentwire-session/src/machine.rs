//! Connection state machine.
//!
//! Pure and synchronous: [`transition`] maps the current state and one input
//! to the next state plus the effects the connection manager must carry out.
//! Every decision about whether the client should be connected is made here.

use std::time::Duration;

use agentwire_core::{ReconnectPolicy, SessionStatus};

/// Something that happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Caller asked to connect.
    Connect,
    /// Caller asked to close.
    Close,
    /// The transport finished opening.
    Opened,
    /// The transport failed to open, errored, or closed without being asked to.
    Dropped,
    /// The reconnect timer fired.
    TimerFired,
}

/// Side effect requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Start opening the transport against the current endpoint.
    OpenTransport,
    /// Tear down the current transport, if any.
    CloseTransport,
    /// Arm the reconnect timer.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Drain the outbound queue.
    FlushQueue,
    /// Reconnect attempts exhausted.
    Fatal { attempts: u32 },
}

/// Status plus the reconnect attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineState {
    pub status: SessionStatus,
    pub attempts: u32,
}

/// Result of applying one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub attempts: u32,
    pub effects: Vec<Effect>,
}

impl Transition {
    /// The input was not valid in the current state.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.from == self.to && self.effects.is_empty()
    }
}

/// The transition function.
#[must_use]
pub fn transition(
    state: MachineState,
    input: Input,
    policy: &ReconnectPolicy,
) -> (MachineState, Vec<Effect>) {
    use SessionStatus::{Closed, Connecting, Failed, Idle, Open, Reconnecting};

    match (state.status, input) {
        (Idle | Closed | Failed | Reconnecting, Input::Connect) => (
            MachineState {
                status: Connecting,
                attempts: 0,
            },
            vec![Effect::CancelReconnect, Effect::OpenTransport],
        ),
        (Idle | Connecting | Open | Reconnecting, Input::Close) => (
            MachineState {
                status: Closed,
                attempts: state.attempts,
            },
            vec![Effect::CancelReconnect, Effect::CloseTransport],
        ),
        (Connecting, Input::Opened) => (
            MachineState {
                status: Open,
                attempts: 0,
            },
            vec![Effect::FlushQueue],
        ),
        (Connecting | Open, Input::Dropped) if state.attempts < policy.max_attempts => {
            let attempt = state.attempts + 1;
            (
                MachineState {
                    status: Reconnecting,
                    attempts: attempt,
                },
                vec![
                    Effect::CloseTransport,
                    Effect::ScheduleReconnect {
                        attempt,
                        delay: policy.delay_for(attempt),
                    },
                ],
            )
        }
        (Connecting | Open, Input::Dropped) => (
            MachineState {
                status: Failed,
                attempts: state.attempts,
            },
            vec![
                Effect::CloseTransport,
                Effect::Fatal {
                    attempts: state.attempts,
                },
            ],
        ),
        (Reconnecting, Input::TimerFired) => (
            MachineState {
                status: Connecting,
                attempts: state.attempts,
            },
            vec![Effect::OpenTransport],
        ),
        _ => (state, Vec::new()),
    }
}

/// Owned machine: current state plus its policy.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: MachineState,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    /// Create an idle machine.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: MachineState::default(),
            policy,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.state.status
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.state.attempts
    }

    /// Apply one input.
    pub fn apply(&mut self, input: Input) -> Transition {
        let from = self.state.status;
        let (next, effects) = transition(self.state, input, &self.policy);
        self.state = next;
        Transition {
            from,
            to: next.status,
            attempts: next.attempts,
            effects,
        }
    }
}
