// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskSpecError {
    #[error("Malformed task spec: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Immutable description of a submitted job, transmitted once to every
/// peer that spawns a worker for it.
///
/// Argument and environment entries are raw octet strings: nothing here
/// may assume valid UTF-8, which is why the envelope is a length-prefixed
/// binary encoding rather than a textual one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Path of the client program (re-executed in worker mode).
    pub program: PathBuf,
    /// Working directory the worker process starts in.
    pub cwd: PathBuf,
    /// Command-line arguments of the client program.
    pub args: Vec<Vec<u8>>,
    /// Environment of the client program, in its original order.
    pub env: Vec<(Vec<u8>, Vec<u8>)>,

    /// Number of initial items.
    pub nitems: u64,
    /// Number of user kernels in the chain.
    pub nkernels: u32,
    /// Number of local values shipped alongside the kernels.
    pub nlocals: u32,
}

impl TaskSpec {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serializing a task spec cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TaskSpecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
#[path = "tests/taskspec_tests.rs"]
mod taskspec_tests;
