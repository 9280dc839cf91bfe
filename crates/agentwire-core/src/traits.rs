//! Transport seam.
//!
//! The session crate never names a concrete transport; it asks a
//! [`Transport`] for a [`TransportLink`] and owns that link exclusively.

use async_trait::async_trait;
use futures::stream::BoxStream;
use url::Url;

use crate::error::ConnectionError;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Text payload, expected to hold one envelope.
    Text(String),
    /// The peer closed the channel.
    Closed { code: Option<u16>, reason: String },
}

/// Inbound half of a link. Ends when the channel is gone.
pub type FrameStream = BoxStream<'static, Result<InboundFrame, ConnectionError>>;

/// Outbound half of a link.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Close the channel cleanly.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// An open channel, split into its two halves.
pub struct TransportLink {
    pub sink: Box<dyn FrameSink>,
    pub frames: FrameStream,
}

impl TransportLink {
    /// Bundle a sink and a frame stream.
    pub fn new(sink: impl FrameSink + 'static, frames: FrameStream) -> Self {
        Self {
            sink: Box::new(sink),
            frames,
        }
    }
}

/// Trait for opening the persistent channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to `url`.
    async fn open(&self, url: &Url) -> Result<TransportLink, ConnectionError>;
}
