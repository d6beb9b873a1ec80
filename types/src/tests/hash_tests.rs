// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;

#[test]
fn deterministic_across_calls() {
    let key = b"NGC-1300";
    assert_eq!(hash_key(16, key), hash_key(16, key));
}

#[test]
fn stays_within_modulus() {
    for maxpeers in 1..20u32 {
        for i in 0..100u64 {
            let key = bincode::serialize(&i).unwrap();
            assert!(hash_key(maxpeers, &key) < maxpeers);
        }
    }
}

#[test]
fn single_destination_funnels_everything() {
    for i in 0..50u64 {
        let key = bincode::serialize(&i).unwrap();
        assert_eq!(hash_key(1, &key), 0);
    }
}
