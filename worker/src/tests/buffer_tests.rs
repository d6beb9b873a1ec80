// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use std::{collections::HashSet, thread, time::Duration};

const BUDGET: usize = 1024 * 1024;

fn buffer() -> Arc<GatherBuffer> {
    GatherBuffer::new(0, BUDGET, 0).unwrap()
}

fn key(name: &str) -> Bytes {
    Bytes::from(name.as_bytes().to_vec())
}

#[test]
fn single_chain_round_trip() {
    let buffer = buffer();
    buffer.append(key("a"), b"one").unwrap();
    buffer.append(key("a"), b"two").unwrap();
    buffer.append(key("a"), b"three").unwrap();
    buffer.all_received();

    let mut items = buffer.items();
    let (k, values) = items.next().unwrap();
    assert_eq!(k, key("a"));
    let values: Vec<Bytes> = values.collect();
    assert_eq!(values, vec![b"one".as_ref(), b"two".as_ref(), b"three".as_ref()]);
    assert!(items.next().is_none());
}

#[test]
fn keys_are_delivered_in_arrival_order() {
    let buffer = buffer();
    for name in ["delta", "alpha", "zulu"] {
        buffer.append(key(name), b"v").unwrap();
    }
    // A repeated key must not appear twice in the key chain.
    buffer.append(key("alpha"), b"w").unwrap();
    buffer.all_received();
    assert_eq!(buffer.distinct_keys(), 3);

    let order: Vec<Bytes> = buffer.items().map(|(k, values)| {
        values.count();
        k
    }).collect();
    assert_eq!(order, vec![key("delta"), key("alpha"), key("zulu")]);
}

#[test]
fn values_interleave_across_keys() {
    let buffer = buffer();
    buffer.append(key("x"), b"x1").unwrap();
    buffer.append(key("y"), b"y1").unwrap();
    buffer.append(key("x"), b"x2").unwrap();
    buffer.append(key("y"), b"y2").unwrap();
    buffer.all_received();

    for (k, values) in buffer.items() {
        let values: Vec<Bytes> = values.collect();
        if k == key("x") {
            assert_eq!(values, vec![b"x1".as_ref(), b"x2".as_ref()]);
        } else {
            assert_eq!(values, vec![b"y1".as_ref(), b"y2".as_ref()]);
        }
    }
}

#[test]
fn each_key_goes_to_exactly_one_iterator() {
    let buffer = buffer();
    for i in 0..100u32 {
        buffer.append(Bytes::from(i.to_le_bytes().to_vec()), b"v").unwrap();
    }
    buffer.all_received();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let buffer = buffer.clone();
        handles.push(thread::spawn(move || {
            let mut seen = Vec::new();
            for (k, values) in buffer.items() {
                values.count();
                seen.push(k);
            }
            seen
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let distinct: HashSet<Bytes> = all.iter().cloned().collect();
    assert_eq!(all.len(), 100, "some key was delivered twice");
    assert_eq!(distinct.len(), 100);
}

#[test]
fn blocked_value_iterator_wakes_on_append() {
    let buffer = buffer();
    buffer.append(key("k"), b"first").unwrap();

    let reader = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            let (_, values) = buffer.items().next().unwrap();
            let values: Vec<Bytes> = values.collect();
            values
        })
    };

    // Give the reader time to drain the first value and block.
    thread::sleep(Duration::from_millis(50));
    buffer.append(key("k"), b"second").unwrap();
    thread::sleep(Duration::from_millis(50));
    buffer.all_received();

    let values = reader.join().unwrap();
    assert_eq!(values, vec![b"first".as_ref(), b"second".as_ref()]);
}

#[test]
fn blocked_key_iterator_wakes_on_completion() {
    let buffer = buffer();
    let reader = {
        let buffer = buffer.clone();
        thread::spawn(move || buffer.items().next().is_none())
    };
    thread::sleep(Duration::from_millis(50));
    buffer.all_received();
    assert!(reader.join().unwrap(), "iterator must observe termination");
}

#[test]
fn late_values_reach_a_waiting_iterator() {
    // The watermark is zero: every append must wake the reader.
    let buffer = GatherBuffer::new(3, BUDGET, 0).unwrap();
    let reader = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            let mut totals = Vec::new();
            for (_, values) in buffer.items() {
                totals.push(values.count());
            }
            totals
        })
    };
    for _ in 0..3 {
        thread::sleep(Duration::from_millis(20));
        buffer.append(key("slow"), b"v").unwrap();
    }
    thread::sleep(Duration::from_millis(20));
    buffer.all_received();
    assert_eq!(reader.join().unwrap(), vec![3]);
}

#[test]
fn exhausted_budget_is_an_error() {
    let tiny = GatherBuffer::new(0, 64, 0).unwrap();
    let mut result = Ok(());
    for _ in 0..8 {
        result = tiny.append(key("k"), b"0123456789abcdef");
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(BufferError::Overflow { .. })));
}
