//! Frame translation between the WebSocket and the backend byte stream.
//!
//! The backend is a raw byte stream with no message framing of its own, so
//! only binary frames carry data.  The mapping is:
//!
//! | Inbound frame | Action                                         |
//! |---------------|------------------------------------------------|
//! | Binary        | write payload to the backend, unchanged        |
//! | Ping          | reply with a Pong carrying the same payload    |
//! | Pong          | ignore                                         |
//! | Text          | ignore (text is not part of the relay protocol)|
//! | Close         | the client is closing the session              |
//! | raw frame     | ignore                                         |
//!
//! In the other direction every chunk read from the backend becomes exactly
//! one binary message: chunk boundaries are message boundaries.
//!
//! These functions have no I/O side effects.

use tokio_tungstenite::tungstenite::Message;

use crate::domain::frame::{FrameKind, InboundAction};

/// Decides what to do with one message received from the client.
///
/// # Example
///
/// ```rust
/// use tokio_tungstenite::tungstenite::Message;
/// use ws_tcp_relay::application::translate_inbound;
/// use ws_tcp_relay::domain::InboundAction;
///
/// let action = translate_inbound(Message::Binary(vec![1, 2, 3]));
/// assert_eq!(action, InboundAction::ForwardToBackend(vec![1, 2, 3]));
/// ```
pub fn translate_inbound(msg: Message) -> InboundAction {
    match msg {
        Message::Binary(payload) => InboundAction::ForwardToBackend(payload),
        Message::Ping(payload) => InboundAction::ReplyPong(payload),
        Message::Pong(_) => InboundAction::Ignore(FrameKind::Pong),
        Message::Text(_) => InboundAction::Ignore(FrameKind::Text),
        Message::Close(_) => InboundAction::ClientClosed,
        Message::Frame(_) => InboundAction::Ignore(FrameKind::Other),
    }
}

/// Wraps one chunk read from the backend as a binary WebSocket message.
pub fn translate_outbound(chunk: &[u8]) -> Message {
    Message::Binary(chunk.to_vec())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, Frame};

    #[test]
    fn test_binary_is_forwarded_verbatim() {
        // Arrange: payload with every byte value, including ones that are not valid UTF-8
        let payload: Vec<u8> = (0..=255).collect();

        // Act
        let action = translate_inbound(Message::Binary(payload.clone()));

        // Assert
        assert_eq!(action, InboundAction::ForwardToBackend(payload));
    }

    #[test]
    fn test_empty_binary_is_still_forwarded() {
        let action = translate_inbound(Message::Binary(Vec::new()));
        assert_eq!(action, InboundAction::ForwardToBackend(Vec::new()));
    }

    #[test]
    fn test_ping_replies_with_same_payload() {
        let action = translate_inbound(Message::Ping(b"are you there".to_vec()));
        assert_eq!(action, InboundAction::ReplyPong(b"are you there".to_vec()));
    }

    #[test]
    fn test_pong_is_ignored() {
        let action = translate_inbound(Message::Pong(vec![1]));
        assert_eq!(action, InboundAction::Ignore(FrameKind::Pong));
    }

    #[test]
    fn test_text_is_ignored_not_forwarded() {
        // Text must never reach the backend, and must not end the session.
        let action = translate_inbound(Message::Text("SELECT 1;".to_string()));
        assert_eq!(action, InboundAction::Ignore(FrameKind::Text));
    }

    #[test]
    fn test_close_ends_the_session() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(
            translate_inbound(Message::Close(Some(frame))),
            InboundAction::ClientClosed
        );
        assert_eq!(
            translate_inbound(Message::Close(None)),
            InboundAction::ClientClosed
        );
    }

    #[test]
    fn test_raw_frame_is_ignored() {
        let action = translate_inbound(Message::Frame(Frame::ping(vec![])));
        assert_eq!(action, InboundAction::Ignore(FrameKind::Other));
    }

    #[test]
    fn test_outbound_chunk_becomes_one_binary_message() {
        // Arrange: "Hello" as the backend would deliver it in one read
        let chunk = [0x48, 0x65, 0x6c, 0x6c, 0x6f];

        // Act
        let msg = translate_outbound(&chunk);

        // Assert
        assert_eq!(msg, Message::Binary(b"Hello".to_vec()));
    }
}
