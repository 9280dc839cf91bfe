//! Core abstractions for realtime agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - Validated wire envelope with a typed discriminant
//! - `ClientConfig` / `ReconnectPolicy` - Explicit client configuration
//! - `StatusFeed` - Broadcast + history of session events, plus a status watch
//! - `Transport` - Seam for the persistent bidirectional channel
//! - Error taxonomy shared by the session and transport crates

pub mod config;
pub mod envelope;
pub mod error;
pub mod payload;
pub mod session;
pub mod status_feed;
pub mod traits;

pub use config::{ClientConfig, Endpoint, ReconnectPolicy};
pub use envelope::{Consumer, Envelope, EnvelopeKind};
pub use error::{
    ClientError, ConfigError, ConnectionError, HandlerError, ProtocolError, SendFailure,
};
pub use session::{Session, SessionId, SessionStatus};
pub use status_feed::{SessionEvent, StatusFeed};
pub use traits::{FrameSink, FrameStream, InboundFrame, Transport, TransportLink};
