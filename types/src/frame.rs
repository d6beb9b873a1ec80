// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Stage;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
}

/// One unit of scatter/gather traffic. Control traffic rides the same
/// channel as data with its own variant rather than a sentinel key, so
/// the receiver dispatches on the tag alone.
///
/// `AckDone` is sent by a scatterer once the last local kernel thread
/// producing for `stage` has finished; the gatherer echoes it back on
/// the same connection to acknowledge that everything sent before it has
/// been buffered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Data { stage: Stage, key: Bytes, value: Bytes },
    AckDone { stage: Stage },
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        Bytes::from(bincode::serialize(self).expect("serializing a frame cannot fail"))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
#[path = "tests/frame_tests.rs"]
mod frame_tests;
