// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;

#[test]
fn data_frame_round_trip() {
    let frame = Frame::Data {
        stage: 2,
        key: Bytes::from_static(b"galaxy"),
        value: Bytes::from(vec![0u8, 255, 7, 42]),
    };
    let decoded = Frame::decode(&frame.encode()).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn ack_frame_round_trip() {
    let frame = Frame::AckDone { stage: -1 };
    let decoded = Frame::decode(&frame.encode()).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn garbage_is_rejected() {
    assert!(Frame::decode(&[0xde, 0xad, 0xbe, 0xef, 0xff]).is_err());
}
