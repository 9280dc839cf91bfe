//! Reconnecting realtime session client.
//!
//! Provides:
//! - `SessionClient` - Handle to the driver task that owns a session
//! - `ConnectionManager` / `ConnectionMachine` - Transport lifecycle and backoff
//! - `OutboundQueue` - FIFO buffer for messages sent while not connected
//! - `EventRouter` - Per-discriminant dispatch of inbound envelopes
//! - `SessionState` - Session identity, agent binding and handoff

pub mod client;
pub mod connection;
pub mod machine;
pub mod queue;
pub mod router;
pub mod state;
pub mod timer;

pub use client::SessionClient;
pub use connection::{ConnectionManager, ConnectionOptions, LinkEvent, Outcome};
pub use machine::{ConnectionMachine, Effect, Input, Transition};
pub use queue::{FlushReport, OutboundQueue, OutboundSink, QueuedMessage};
pub use router::{DispatchOutcome, EventHandler, EventRouter, RouterStats};
pub use state::SessionState;
