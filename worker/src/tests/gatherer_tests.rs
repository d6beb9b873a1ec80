// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use config::Parameters;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use types::Frame;

use network::wire_codec;

async fn connect(gatherer: &Gatherer) -> Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec> {
    let (host, port) = gatherer.addr();
    let stream = TcpStream::connect((host.as_str(), port)).await.unwrap();
    Framed::new(stream, wire_codec())
}

#[tokio::test]
async fn data_frames_land_in_the_stage_buffer() {
    let gatherer = Gatherer::spawn("127.0.0.1", &Parameters::default())
        .await
        .unwrap();
    let mut transport = connect(&gatherer).await;

    for value in [&b"v1"[..], &b"v2"[..]] {
        let frame = Frame::Data {
            stage: 3,
            key: Bytes::from_static(b"star"),
            value: Bytes::from(value.to_vec()),
        };
        transport.send(frame.encode()).await.unwrap();
    }
    // The ack round trip orders us after the data frames.
    transport.send(Frame::AckDone { stage: 3 }.encode()).await.unwrap();
    let echo = transport.next().await.unwrap().unwrap();
    assert_eq!(Frame::decode(&echo).unwrap(), Frame::AckDone { stage: 3 });

    let buffer = gatherer.get_or_create_buffer(3).unwrap();
    buffer.all_received();
    let collected: Vec<(Bytes, Vec<Bytes>)> = buffer
        .items()
        .map(|(k, values)| (k, values.collect()))
        .collect();
    assert_eq!(
        collected,
        vec![(
            Bytes::from_static(b"star"),
            vec![Bytes::from_static(b"v1"), Bytes::from_static(b"v2")]
        )]
    );
}

#[tokio::test]
async fn ack_frames_are_echoed_not_buffered() {
    let gatherer = Gatherer::spawn("127.0.0.1", &Parameters::default())
        .await
        .unwrap();
    let mut transport = connect(&gatherer).await;

    transport.send(Frame::AckDone { stage: 0 }.encode()).await.unwrap();
    let echo = transport.next().await.unwrap().unwrap();
    assert_eq!(Frame::decode(&echo).unwrap(), Frame::AckDone { stage: 0 });

    let buffer = gatherer.get_or_create_buffer(0).unwrap();
    assert_eq!(buffer.distinct_keys(), 0);
}

#[tokio::test]
async fn stage_ended_completes_the_next_buffer() {
    let gatherer = Gatherer::spawn("127.0.0.1", &Parameters::default())
        .await
        .unwrap();
    gatherer.stage_ended(1).unwrap();
    assert!(gatherer.get_or_create_buffer(2).unwrap().is_all_received());
    assert!(!gatherer.get_or_create_buffer(1).unwrap().is_all_received());
}

#[tokio::test]
async fn malformed_frames_close_the_channel() {
    let gatherer = Gatherer::spawn("127.0.0.1", &Parameters::default())
        .await
        .unwrap();
    let mut transport = connect(&gatherer).await;

    transport.send(Bytes::from_static(b"not a frame")).await.unwrap();
    // The gatherer drops the connection; the next read reports EOF.
    let next = transport.next().await;
    assert!(next.is_none() || next.unwrap().is_err());
}
