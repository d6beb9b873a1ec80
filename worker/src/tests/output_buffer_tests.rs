// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use config::Parameters;
use std::thread;
use std::time::Duration;
use types::Frame;

fn encode_key(n: u64) -> Bytes {
    Bytes::from(bincode::serialize(&n).unwrap())
}

fn new_buffer(budget: usize, maxpeers: u32) -> (OutputBuffer, OutputCursor) {
    OutputBuffer::new(1, maxpeers, budget, Arc::new(Notify::new()), None).unwrap()
}

fn expect_data(record: OutputRecord) -> (KeyHash, Bytes) {
    match record {
        OutputRecord::Data { keyhash, frame } => (keyhash, frame),
        OutputRecord::Eof => panic!("unexpected eof"),
    }
}

#[tokio::test]
async fn records_round_trip() {
    let (producer, mut cursor) = new_buffer(1024 * 1024, 4);
    assert!(cursor.try_next().is_none());

    producer.queue(encode_key(7), Bytes::from_static(b"v1")).unwrap();
    producer.queue(encode_key(7), Bytes::from_static(b"v2")).unwrap();
    producer.queue_eof().unwrap();

    let expected_hash = hash_key(4, &encode_key(7));
    let (keyhash, frame) = expect_data(cursor.try_next().unwrap());
    assert_eq!(keyhash, expected_hash);
    match Frame::decode(&frame).unwrap() {
        Frame::Data { stage, key, value } => {
            assert_eq!(stage, 1);
            assert_eq!(key, encode_key(7));
            assert_eq!(value, Bytes::from_static(b"v1"));
        }
        other => panic!("unexpected frame {other:?}"),
    }
    let (_, frame) = expect_data(cursor.try_next().unwrap());
    assert!(matches!(
        Frame::decode(&frame).unwrap(),
        Frame::Data { value, .. } if value == Bytes::from_static(b"v2")
    ));
    assert_eq!(cursor.try_next().unwrap(), OutputRecord::Eof);
    assert!(cursor.try_next().is_none());
}

#[tokio::test]
async fn ring_wraps_and_preserves_order() {
    // Budget fits only a couple of records at a time.
    let (producer, cursor) = new_buffer(256, 1);
    let mut cursor = cursor;

    let producer = Arc::new(producer);
    let writer = {
        let producer = producer.clone();
        thread::spawn(move || {
            for i in 0..64u64 {
                producer
                    .queue(encode_key(0), Bytes::from(vec![i as u8; 16]))
                    .unwrap();
            }
            producer.queue_eof().unwrap();
        })
    };

    let mut seen = Vec::new();
    loop {
        match cursor.try_next() {
            Some(OutputRecord::Data { frame, .. }) => match Frame::decode(&frame).unwrap() {
                Frame::Data { value, .. } => seen.push(value[0]),
                other => panic!("unexpected frame {other:?}"),
            },
            Some(OutputRecord::Eof) => break,
            None => tokio::time::sleep(Duration::from_millis(1)).await,
        }
    }
    writer.join().unwrap();
    let expected: Vec<u8> = (0..64).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn full_ring_blocks_the_producer_until_drained() {
    let (producer, mut cursor) = new_buffer(128, 1);

    let producer = Arc::new(producer);
    let writer = {
        let producer = producer.clone();
        thread::spawn(move || {
            // Far more data than the ring can hold at once.
            for _ in 0..32 {
                producer.queue(encode_key(0), Bytes::from(vec![0u8; 32])).unwrap();
            }
        })
    };

    // The writer cannot have finished: nothing was consumed yet.
    thread::sleep(Duration::from_millis(100));
    assert!(!writer.is_finished());

    let mut drained = 0;
    while drained < 32 {
        if cursor.try_next().is_some() {
            drained += 1;
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    writer.join().unwrap();
}

#[tokio::test]
async fn oversized_record_is_rejected() {
    let (producer, _cursor) = new_buffer(64, 1);
    let result = producer.queue(encode_key(0), Bytes::from(vec![0u8; 1024]));
    assert!(matches!(result, Err(BufferError::Overflow { .. })));
}

#[tokio::test]
async fn local_destinations_bypass_the_ring() {
    let parameters = Parameters {
        buffer_budget: 1024 * 1024,
        ..Parameters::default()
    };
    let gatherer = Gatherer::spawn("127.0.0.1", &parameters).await.unwrap();
    let local = Arc::new(DashSet::new());

    let (producer, mut cursor) = OutputBuffer::new(
        2,
        4,
        1024 * 1024,
        Arc::new(Notify::new()),
        Some(Bypass {
            gatherer: gatherer.clone(),
            local: local.clone(),
        }),
    )
    .unwrap();

    let key = encode_key(42);
    local.insert((2, hash_key(4, &key)));

    producer.queue(key.clone(), Bytes::from_static(b"direct")).unwrap();

    // The record went straight to the gather buffer, not the ring.
    assert!(cursor.try_next().is_none());
    let buffer = gatherer.get_or_create_buffer(2).unwrap();
    buffer.all_received();
    let collected: Vec<(Bytes, Vec<Bytes>)> = buffer
        .items()
        .map(|(k, values)| (k, values.collect()))
        .collect();
    assert_eq!(collected, vec![(key, vec![Bytes::from_static(b"direct")])]);
}
