// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod frame;
mod progress;
mod rpc;
mod taskspec;

pub use frame::*;
pub use progress::*;
pub use rpc::*;
pub use taskspec::*;

/// Pipeline stage index. Stage -1 is the synthetic feeder, stages
/// `0..nkernels` run user kernels, stage `nkernels` is the synthetic
/// collector that funnels results back to the client.
pub type Stage = i32;

/// Routing coordinate of a key for one stage.
pub type KeyHash = u32;

/// Reduce a key to its routing coordinate. The routed key is its
/// serialized byte string, so the hash is stable across workers for the
/// same key by construction.
pub fn hash_key(maxpeers: u32, key: &[u8]) -> KeyHash {
    debug_assert!(maxpeers > 0);
    crc32fast::hash(key) % maxpeers
}

#[cfg(test)]
#[path = "tests/hash_tests.rs"]
mod hash_tests;
