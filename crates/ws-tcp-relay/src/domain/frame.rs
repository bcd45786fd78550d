//! What an inbound WebSocket frame means for the backend.

use std::fmt;

/// The kind of a WebSocket frame, used for logging ignored frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Binary,
    Text,
    Ping,
    Pong,
    Close,
    /// A raw frame the WebSocket layer did not assemble into a message.
    Other,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Text => "text",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Close => "close",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action the inbound pump takes for one frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// Write these bytes to the backend, unchanged.
    ForwardToBackend(Vec<u8>),
    /// Answer on the WebSocket with a Pong carrying this payload.
    ReplyPong(Vec<u8>),
    /// Nothing to do; the session carries on.
    Ignore(FrameKind),
    /// The client started the closing handshake.
    ClientClosed,
}
