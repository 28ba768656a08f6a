//! Plain-text test protocol.
//!
//! `PING:<payload>`, `PONG:<payload>`, `ECHO:<payload>`, `QUIT` and `STOP`,
//! encoded as UTF-8 frame bodies. The codec counts decode attempts so tests
//! can assert how often the server loop invoked it.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use switchyard_core::{Codec, CodecError};

/// Messages of the text protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextMessage {
    /// Request answered with `Pong` carrying the same payload
    Ping(String),
    /// Response to `Ping`
    Pong(String),
    /// Request answered with itself
    Echo(String),
    /// Ask the server to close this session
    Quit,
    /// Ask the server to stop
    Stop,
}

/// [`Codec`] for [`TextMessage`].
#[derive(Debug, Clone, Default)]
pub struct TextCodec {
    decodes: Arc<AtomicUsize>,
}

impl TextCodec {
    /// Create a codec with a zeroed decode counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode attempts so far, failed ones included, across all clones.
    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    /// Encoding of `message`, for comparing against written frames.
    pub fn body(message: &TextMessage) -> Bytes {
        let text = match message {
            TextMessage::Ping(payload) => format!("PING:{payload}"),
            TextMessage::Pong(payload) => format!("PONG:{payload}"),
            TextMessage::Echo(payload) => format!("ECHO:{payload}"),
            TextMessage::Quit => "QUIT".to_string(),
            TextMessage::Stop => "STOP".to_string(),
        };
        Bytes::from(text)
    }
}

impl Codec for TextCodec {
    type Message = TextMessage;

    fn decode(&self, body: &Bytes) -> Result<TextMessage, CodecError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);

        let text = std::str::from_utf8(body).map_err(|e| CodecError::Decode(e.to_string()))?;
        let message = match text.split_once(':') {
            Some(("PING", payload)) => TextMessage::Ping(payload.to_string()),
            Some(("PONG", payload)) => TextMessage::Pong(payload.to_string()),
            Some(("ECHO", payload)) => TextMessage::Echo(payload.to_string()),
            None if text == "QUIT" => TextMessage::Quit,
            None if text == "STOP" => TextMessage::Stop,
            _ => return Err(CodecError::Decode(format!("unknown message {text:?}"))),
        };
        Ok(message)
    }

    fn encode(&self, message: &TextMessage) -> Result<Bytes, CodecError> {
        Ok(Self::body(message))
    }
}
