//! WebSocket client transport.

use agentwire_core::{ConnectionError, FrameSink, Transport, TransportLink};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use url::Url;

use crate::protocol;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` / `wss://` connections with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Create a websocket transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink, ConnectionError> {
        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Open(e.to_string()))?;
        tracing::debug!(url = %url, status = %response.status(), "WebSocket connected");

        let (sink, stream) = ws.split();
        let frames = stream
            .filter_map(|message| async move { protocol::inbound(message) })
            .boxed();

        Ok(TransportLink::new(WsSink { inner: sink }, frames))
    }
}

/// Write half of an open websocket.
struct WsSink {
    inner: SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.inner
            .send(protocol::outbound(text))
            .await
            .map_err(|e| ConnectionError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.inner.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(ConnectionError::Write(e.to_string())),
        }
    }
}
