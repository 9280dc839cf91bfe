//! Mapping between websocket messages and session frames.

use agentwire_core::{ConnectionError, InboundFrame};
use tokio_tungstenite::tungstenite::{self, Message};

/// Map one received websocket message.
///
/// Returns `None` for messages the session never sees: control frames, which
/// the websocket library answers itself, and binary frames that are not
/// UTF-8.
#[must_use]
pub fn inbound(
    message: Result<Message, tungstenite::Error>,
) -> Option<Result<InboundFrame, ConnectionError>> {
    let message = match message {
        Ok(message) => message,
        Err(e) => return Some(Err(read_error(e))),
    };

    match message {
        Message::Text(text) => Some(Ok(InboundFrame::Text(text.as_str().to_owned()))),
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(Ok(InboundFrame::Text(text))),
            Err(_) => {
                tracing::warn!(len = data.len(), "Dropping non-UTF-8 binary frame");
                None
            }
        },
        Message::Close(frame) => {
            let (code, reason) = frame.map_or((None, String::new()), |f| {
                (Some(u16::from(f.code)), f.reason.as_str().to_owned())
            });
            Some(Ok(InboundFrame::Closed { code, reason }))
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

/// Outbound text frame.
#[must_use]
pub fn outbound(text: String) -> Message {
    Message::Text(text.into())
}

fn read_error(error: tungstenite::Error) -> ConnectionError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::StreamEnded
        }
        other => ConnectionError::Read(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

    use super::*;

    #[test]
    fn test_text_and_utf8_binary_become_text() {
        let text = inbound(Ok(Message::Text("{\"type\":\"pong\"}".into())));
        assert_eq!(
            text.unwrap().unwrap(),
            InboundFrame::Text("{\"type\":\"pong\"}".into())
        );

        let binary = inbound(Ok(Message::Binary(b"{}".to_vec().into())));
        assert_eq!(binary.unwrap().unwrap(), InboundFrame::Text("{}".into()));
    }

    #[test]
    fn test_non_utf8_binary_and_control_frames_are_skipped() {
        assert!(inbound(Ok(Message::Binary(vec![0xff, 0xfe].into()))).is_none());
        assert!(inbound(Ok(Message::Ping(Vec::new().into()))).is_none());
        assert!(inbound(Ok(Message::Pong(Vec::new().into()))).is_none());
    }

    #[test]
    fn test_close_frames_carry_code_and_reason() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "agent restarting".into(),
        };
        assert_eq!(
            inbound(Ok(Message::Close(Some(frame)))).unwrap().unwrap(),
            InboundFrame::Closed {
                code: Some(1000),
                reason: "agent restarting".into()
            }
        );
        assert_eq!(
            inbound(Ok(Message::Close(None))).unwrap().unwrap(),
            InboundFrame::Closed {
                code: None,
                reason: String::new()
            }
        );
    }

    #[test]
    fn test_read_errors() {
        assert_eq!(
            inbound(Err(tungstenite::Error::ConnectionClosed)).unwrap(),
            Err(ConnectionError::StreamEnded)
        );
        assert!(matches!(
            inbound(Err(tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer"
            ))))
            .unwrap(),
            Err(ConnectionError::Read(_))
        ));
    }
}
