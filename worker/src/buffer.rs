// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-stage gather buffer: an append-only log of value records in
//! one anonymous memory mapping, organized as singly-linked chains
//! indexed by key.
//!
//! Record layout: `[value_len: u64 LE][value][next_offset: u64 LE]`.
//! `next_offset` holds the all-ones sentinel until a successor record
//! for the same key is appended, at which point it is patched in place
//! with the successor's absolute offset. A distinguished key chain links
//! one marker record per distinct key (`bincode (key, head_offset)`), in
//! arrival order, which is how iterators discover keys as they arrive.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use types::Stage;

/// Marks the tail of a chain: no successor yet.
const NEXT_SENTINEL: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Buffer for stage {stage} exhausted its {budget} byte budget")]
    Overflow { stage: Stage, budget: usize },
    #[error("Failed to map buffer memory: {0}")]
    Map(#[from] std::io::Error),
    #[error("Corrupt key marker: {0}")]
    CorruptMarker(#[from] bincode::Error),
}

/// Chain endpoints: the offset of the first record, and the offset of
/// the `next_offset` field of the last record (the patch point).
#[derive(Clone, Copy)]
struct Chain {
    head: usize,
    tail_next: usize,
}

struct ValueWaiterState {
    signaled: bool,
    pending: usize,
}

/// Wakes the single iterator blocked on a key when enough new bytes have
/// accumulated for it (or when the stage completes).
struct ValueWaiter {
    state: Mutex<ValueWaiterState>,
    condvar: Condvar,
}

impl ValueWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ValueWaiterState {
                signaled: false,
                pending: 0,
            }),
            condvar: Condvar::new(),
        })
    }

    fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.pending = 0;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.signaled {
            self.condvar.wait(&mut state);
        }
        state.signaled = false;
    }
}

struct Inner {
    map: MmapMut,
    write_pos: usize,
    chains: HashMap<Bytes, Chain>,
    key_chain: Chain,
    /// Offset of the `next_offset` field after the last key marker any
    /// iterator has consumed. Shared by all iterators of the stage so
    /// each key is delivered to exactly one of them.
    key_cursor: usize,
    all_received: bool,
    waiters: HashMap<Bytes, Arc<ValueWaiter>>,
}

impl Inner {
    fn read_u64(&self, at: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.map[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, at: usize, value: u64) {
        self.map[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Append one record, returning its offset.
    fn push_record(&mut self, stage: Stage, value: &[u8]) -> Result<usize, BufferError> {
        let need = 8 + value.len() + 8;
        if self.write_pos + need > self.map.len() {
            return Err(BufferError::Overflow {
                stage,
                budget: self.map.len(),
            });
        }
        let at = self.write_pos;
        self.write_u64(at, value.len() as u64);
        self.map[at + 8..at + 8 + value.len()].copy_from_slice(value);
        self.write_u64(at + 8 + value.len(), NEXT_SENTINEL);
        self.write_pos += need;
        Ok(at)
    }

    /// Append a value record for `key`, linking it into the key's chain.
    /// Returns true when this created the chain (i.e. a new key).
    fn append(&mut self, stage: Stage, key: &Bytes, value: &[u8]) -> Result<bool, BufferError> {
        let at = self.push_record(stage, value)?;
        let next_field = at + 8 + value.len();
        if let Some(chain) = self.chains.get_mut(key) {
            let patch_point = chain.tail_next;
            chain.tail_next = next_field;
            self.write_u64(patch_point, at as u64);
            return Ok(false);
        }
        self.chains.insert(
            key.clone(),
            Chain {
                head: at,
                tail_next: next_field,
            },
        );

        // Link the new key into the key chain so iterators can find it.
        let marker = bincode::serialize(&(key.as_ref(), at as u64))
            .expect("serializing a key marker cannot fail");
        let marker_at = self.push_record(stage, &marker)?;
        let patch_point = self.key_chain.tail_next;
        self.key_chain.tail_next = marker_at + 8 + marker.len();
        self.write_u64(patch_point, marker_at as u64);
        Ok(true)
    }
}

/// One stage's buffer. Appenders are the gatherer I/O tasks (and the
/// local-bypass path); readers are the stage's kernel threads.
pub struct GatherBuffer {
    stage: Stage,
    watermark: usize,
    inner: Mutex<Inner>,
    new_key: Condvar,
}

impl GatherBuffer {
    pub fn new(stage: Stage, budget: usize, watermark: usize) -> Result<Arc<Self>, BufferError> {
        let mut inner = Inner {
            map: MmapMut::map_anon(budget)?,
            write_pos: 0,
            chains: HashMap::new(),
            key_chain: Chain {
                head: 0,
                tail_next: 0,
            },
            key_cursor: 0,
            all_received: false,
            waiters: HashMap::new(),
        };
        // Seed the key chain with an empty marker so the shared cursor
        // always has a next-offset field to poll.
        let head = inner.push_record(stage, &[])?;
        inner.key_chain = Chain {
            head,
            tail_next: head + 8,
        };
        inner.key_cursor = head + 8;

        Ok(Arc::new(Self {
            stage,
            watermark,
            inner: Mutex::new(inner),
            new_key: Condvar::new(),
        }))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn append(&self, key: Bytes, value: &[u8]) -> Result<(), BufferError> {
        let mut inner = self.inner.lock();
        let new_key = inner.append(self.stage, &key, value)?;
        if new_key {
            self.new_key.notify_all();
        }
        if let Some(waiter) = inner.waiters.get(&key).cloned() {
            let mut state = waiter.state.lock();
            state.pending += value.len();
            if state.pending >= self.watermark {
                state.signaled = true;
                state.pending = 0;
                waiter.condvar.notify_all();
            }
        }
        Ok(())
    }

    /// No more data will ever arrive for this stage. Flips exactly once
    /// and wakes every blocked iterator so it can observe termination.
    pub fn all_received(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.all_received {
            return;
        }
        inner.all_received = true;
        self.new_key.notify_all();
        for waiter in inner.waiters.values() {
            waiter.signal();
        }
    }

    pub fn is_all_received(&self) -> bool {
        self.inner.lock().all_received
    }

    /// Blocking iterator over `(key, values)` pairs. Safe to run from
    /// several kernel threads at once: the key cursor is shared, so each
    /// key is delivered to exactly one iterator, in arrival order.
    pub fn items(self: &Arc<Self>) -> Items {
        Items {
            buffer: self.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn distinct_keys(&self) -> usize {
        self.inner.lock().chains.len()
    }
}

pub struct Items {
    buffer: Arc<GatherBuffer>,
}

impl Iterator for Items {
    type Item = (Bytes, ValueIter);

    fn next(&mut self) -> Option<Self::Item> {
        let mut inner = self.buffer.inner.lock();
        loop {
            let next = inner.read_u64(inner.key_cursor);
            if next != NEXT_SENTINEL {
                let record = next as usize;
                let len = inner.read_u64(record) as usize;
                let (key, head): (Vec<u8>, u64) =
                    bincode::deserialize(&inner.map[record + 8..record + 8 + len])
                        .expect("key markers are written by this process");
                inner.key_cursor = record + 8 + len;
                let key = Bytes::from(key);
                return Some((
                    key.clone(),
                    ValueIter {
                        buffer: self.buffer.clone(),
                        key,
                        state: ValueIterState::At(head as usize),
                        waiter: None,
                        done: false,
                    },
                ));
            }
            if inner.all_received {
                return None;
            }
            self.buffer.new_key.wait(&mut inner);
        }
    }
}

enum ValueIterState {
    /// The record at this offset is ready to be read.
    At(usize),
    /// Waiting at the `next_offset` field of the last record read.
    Blocked(usize),
}

/// Walks one key's chain link by link. Blocks at the tail until either a
/// successor is appended or the buffer reports `all_received`.
pub struct ValueIter {
    buffer: Arc<GatherBuffer>,
    key: Bytes,
    state: ValueIterState,
    waiter: Option<Arc<ValueWaiter>>,
    done: bool,
}

impl Iterator for ValueIter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        loop {
            match self.state {
                ValueIterState::At(record) => {
                    let inner = self.buffer.inner.lock();
                    let len = inner.read_u64(record) as usize;
                    let value = Bytes::copy_from_slice(&inner.map[record + 8..record + 8 + len]);
                    let next_field = record + 8 + len;
                    let next = inner.read_u64(next_field);
                    drop(inner);
                    self.state = if next != NEXT_SENTINEL {
                        ValueIterState::At(next as usize)
                    } else {
                        ValueIterState::Blocked(next_field)
                    };
                    return Some(value);
                }
                ValueIterState::Blocked(next_field) => {
                    let mut inner = self.buffer.inner.lock();
                    let next = inner.read_u64(next_field);
                    if next != NEXT_SENTINEL {
                        self.state = ValueIterState::At(next as usize);
                        continue;
                    }
                    if inner.all_received {
                        if self.waiter.take().is_some() {
                            inner.waiters.remove(&self.key);
                        }
                        self.done = true;
                        return None;
                    }
                    let waiter = match &self.waiter {
                        Some(waiter) => waiter.clone(),
                        None => {
                            let waiter = ValueWaiter::new();
                            inner.waiters.insert(self.key.clone(), waiter.clone());
                            self.waiter = Some(waiter.clone());
                            waiter
                        }
                    };
                    drop(inner);
                    waiter.wait();
                }
            }
        }
    }
}

impl Drop for ValueIter {
    fn drop(&mut self) {
        if self.waiter.take().is_some() {
            self.buffer.inner.lock().waiters.remove(&self.key);
        }
    }
}

#[cfg(test)]
#[path = "tests/buffer_tests.rs"]
mod buffer_tests;
