//! Length-prefixed framing.
//!
//! ```text
//! +----------------+---------------------+
//! | len: u32 (BE)  | body: len bytes     |
//! +----------------+---------------------+
//! ```
//!
//! Used by stream transports to turn a byte stream into discrete message
//! bodies. The header is stripped before the body is handed to the codec.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::FrameError;

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Announced body length of the frame at the start of `input`, if the header
/// is complete.
fn announced_len(input: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = input.get(..HEADER_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

/// If `input` starts with a whole frame, strip its header and return the body
/// length. The body is then the first `len` bytes of `input`.
///
/// # Errors
///
/// `FrameError::TooLarge` if the header announces more than `max_len` bytes.
pub fn split_frame(input: &mut BytesMut, max_len: usize) -> Result<Option<usize>, FrameError> {
    let Some(len) = announced_len(input) else {
        return Ok(None);
    };
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    if input.len() < HEADER_LEN + len {
        return Ok(None);
    }

    input.advance(HEADER_LEN);
    Ok(Some(len))
}

/// True if `input` starts with a whole frame (or an oversized header, which
/// the next [`split_frame`] call will reject).
pub fn has_frame(input: &[u8], max_len: usize) -> bool {
    announced_len(input).is_some_and(|len| len > max_len || input.len() >= HEADER_LEN + len)
}

/// Append `body` to `out` with its length header.
///
/// # Errors
///
/// `FrameError::TooLarge` if `body` exceeds `max_len`.
pub fn put_frame(body: &[u8], out: &mut BytesMut, max_len: usize) -> Result<(), FrameError> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= max_len)
        .ok_or(FrameError::TooLarge { len: body.len(), max: max_len })?;

    out.reserve(HEADER_LEN + body.len());
    out.put_u32(len);
    out.put_slice(body);
    Ok(())
}
