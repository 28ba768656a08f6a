//! Message codec.
//!
//! Messages are opaque to the server loop: it decodes complete frames on the
//! event-loop thread and encodes responses right before writing them.

use std::{fmt, marker::PhantomData};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::CodecError;

/// Converts between message values and frame bodies.
pub trait Codec {
    /// Decoded message type.
    type Message: Send + 'static;

    /// Decode one frame body.
    fn decode(&self, body: &Bytes) -> Result<Self::Message, CodecError>;

    /// Encode one message into a frame body.
    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;
}

/// CBOR codec for any serde-compatible message type.
pub struct CborCodec<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> CborCodec<M> {
    /// Create a CBOR codec.
    pub fn new() -> Self {
        Self { _message: PhantomData }
    }
}

impl<M> Default for CborCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for CborCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for CborCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CborCodec").finish()
    }
}

impl<M> Codec for CborCodec<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = M;

    fn decode(&self, body: &Bytes) -> Result<M, CodecError> {
        ciborium::from_reader(body.as_ref()).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode(&self, message: &M) -> Result<Bytes, CodecError> {
        let mut out = Vec::new();
        ciborium::into_writer(message, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(out))
    }
}
