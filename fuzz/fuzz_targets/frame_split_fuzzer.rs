//! Fuzz target for the length-prefixed frame splitter
//!
//! Feeds arbitrary bytes, delivered in arbitrary chunks, through the same
//! split loop the transports run.
//!
//! # Invariants
//!
//! - Never panics, whatever the header announces
//! - A returned body length never exceeds `max_len` or the buffered bytes
//! - `has_frame` agrees with `split_frame` on every buffer state
//! - An oversized header is rejected and nothing after it is consumed

#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use switchyard_core::framing::{self, HEADER_LEN};

#[derive(Debug, Arbitrary)]
struct Input {
    max_len: u16,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let max_len = usize::from(input.max_len);
    let mut buffer = BytesMut::new();

    for chunk in input.chunks {
        buffer.extend_from_slice(&chunk);

        loop {
            let expect_frame = framing::has_frame(&buffer, max_len);
            let before = buffer.len();
            match framing::split_frame(&mut buffer, max_len) {
                Ok(Some(len)) => {
                    assert!(expect_frame);
                    assert!(len <= max_len);
                    assert!(len <= buffer.len());
                    assert_eq!(before, buffer.len() + HEADER_LEN);
                    let _ = buffer.split_to(len);
                },
                Ok(None) => {
                    assert!(!expect_frame);
                    assert_eq!(before, buffer.len());
                    break;
                },
                Err(_) => {
                    assert!(expect_frame);
                    assert_eq!(before, buffer.len());
                    return;
                },
            }
        }
    }
});
