// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single scatter/gather frame. A frame carries one
/// key/value pair; anything larger than this is a protocol violation.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Codec for all framed byte streams of the system: an 8-byte
/// little-endian length prefix followed by the payload. The prefix
/// excludes itself.
pub fn wire_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(8)
        .little_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Prefix `payload` with its length, producing one wire frame. Used on
/// byte streams that are not `Framed` (HTTP progress and result bodies).
pub fn prefix_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

/// Incremental parser for a stream of length-prefixed frames arriving in
/// arbitrary chunks (e.g. an HTTP chunked body).
#[derive(Default)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < 8 {
            return None;
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&self.buffer[..8]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if self.buffer.len() < 8 + len {
            return None;
        }
        self.buffer.advance(8);
        Some(self.buffer.split_to(len).freeze())
    }

    /// Bytes buffered but not yet consumed as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod codec_tests;
