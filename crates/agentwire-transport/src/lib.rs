//! Transports for agentwire sessions.
//!
//! Provides:
//! - Frame mapping between websocket messages and session frames
//! - WebSocket client transport (feature: websocket)

#[cfg(feature = "websocket")]
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::WsTransport;
