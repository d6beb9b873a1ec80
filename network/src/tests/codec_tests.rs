// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;

#[test]
fn prefix_frame_layout() {
    let frame = prefix_frame(b"abc");
    assert_eq!(&frame[..8], &3u64.to_le_bytes());
    assert_eq!(&frame[8..], b"abc");
}

#[test]
fn reader_reassembles_split_chunks() {
    let frame = prefix_frame(b"hello, world");

    let mut reader = FrameReader::new();
    // Feed the frame one byte at a time; it must only appear once whole.
    for (i, byte) in frame.iter().enumerate() {
        assert!(reader.next_frame().is_none(), "complete at byte {i}");
        reader.extend(&[*byte]);
    }
    assert_eq!(reader.next_frame().unwrap().as_ref(), b"hello, world");
    assert!(reader.next_frame().is_none());
    assert_eq!(reader.pending(), 0);
}

#[test]
fn reader_handles_back_to_back_frames() {
    let mut chunk = Vec::new();
    chunk.extend_from_slice(&prefix_frame(b"one"));
    chunk.extend_from_slice(&prefix_frame(b""));
    chunk.extend_from_slice(&prefix_frame(b"three"));

    let mut reader = FrameReader::new();
    reader.extend(&chunk);
    assert_eq!(reader.next_frame().unwrap().as_ref(), b"one");
    assert_eq!(reader.next_frame().unwrap().as_ref(), b"");
    assert_eq!(reader.next_frame().unwrap().as_ref(), b"three");
    assert!(reader.next_frame().is_none());
}
