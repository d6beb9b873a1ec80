// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The output buffer: a ring over an anonymous memory mapping carrying
//! framed records from one kernel thread (producer) to the scatterer
//! (consumer).
//!
//! Record layout: `[keyhash: u32 LE][payload_len: u64 LE][payload]`
//! where the payload is one encoded wire frame. Two keyhash values are
//! reserved: `EOF_KEYHASH` marks the end of the producer's output and
//! `WRAP_KEYHASH` marks wasted bytes at the end of the mapping when a
//! record would not fit contiguously. A full ring blocks the producer
//! until the scatterer drains enough space; records are never dropped.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};
use tokio::sync::{watch, Notify};
use types::{hash_key, Frame, KeyHash, Stage};

use crate::buffer::BufferError;
use crate::gatherer::Gatherer;

/// Keyhash marking the producer's end-of-output record.
pub const EOF_KEYHASH: u32 = u32::MAX;
/// Keyhash marking wasted bytes before a ring wrap-around.
const WRAP_KEYHASH: u32 = u32::MAX - 1;

const HEADER: usize = 4 + 8;

struct Ring {
    map: MmapMut,
    cap: usize,
    write_pos: usize,
    read_pos: usize,
    used: usize,
    total_written: u64,
}

impl Ring {
    fn read_u32(&self, at: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.map[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.map[at..at + 8]);
        u64::from_le_bytes(bytes)
    }
}

struct Shared {
    ring: Mutex<Ring>,
    space: Condvar,
    watermark: watch::Sender<u64>,
    data_ready: Arc<Notify>,
}

/// Everything the producer needs to divert a record around TCP when its
/// destination is this very worker.
pub struct Bypass {
    pub gatherer: Arc<Gatherer>,
    pub local: Arc<DashSet<(Stage, KeyHash)>>,
}

/// Producer handle, owned by one kernel thread. All records are destined
/// for `stage`; `maxpeers` is that stage's routing modulus.
pub struct OutputBuffer {
    stage: Stage,
    maxpeers: u32,
    shared: Arc<Shared>,
    bypass: Option<Bypass>,
}

impl OutputBuffer {
    pub fn new(
        stage: Stage,
        maxpeers: u32,
        budget: usize,
        data_ready: Arc<Notify>,
        bypass: Option<Bypass>,
    ) -> Result<(Self, OutputCursor), BufferError> {
        let (watermark, watermark_rx) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                map: MmapMut::map_anon(budget)?,
                cap: budget,
                write_pos: 0,
                read_pos: 0,
                used: 0,
                total_written: 0,
            }),
            space: Condvar::new(),
            watermark,
            data_ready,
        });
        let producer = Self {
            stage,
            maxpeers,
            shared: shared.clone(),
            bypass,
        };
        let cursor = OutputCursor {
            stage,
            shared,
            watermark: watermark_rx,
            total_read: 0,
        };
        Ok((producer, cursor))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Queue one emitted pair for its destination worker. Pairs whose
    /// destination is known to be local skip the ring and append
    /// straight to the gatherer buffer.
    pub fn queue(&self, key: Bytes, value: Bytes) -> Result<(), BufferError> {
        let keyhash = hash_key(self.maxpeers, &key);
        if let Some(bypass) = &self.bypass {
            if bypass.local.contains(&(self.stage, keyhash)) {
                return bypass.gatherer.append(self.stage, key, &value);
            }
        }
        let frame = Frame::Data {
            stage: self.stage,
            key,
            value,
        }
        .encode();
        self.push(keyhash, &frame)
    }

    /// Mark the end of this producer's output.
    pub fn queue_eof(&self) -> Result<(), BufferError> {
        self.push(EOF_KEYHASH, &[])
    }

    fn push(&self, keyhash: u32, payload: &[u8]) -> Result<(), BufferError> {
        let need = HEADER + payload.len();
        let mut ring = self.shared.ring.lock();
        if need + 4 > ring.cap {
            return Err(BufferError::Overflow {
                stage: self.stage,
                budget: ring.cap,
            });
        }
        loop {
            if ring.used == 0 {
                ring.write_pos = 0;
                ring.read_pos = 0;
                break;
            }
            if ring.write_pos > ring.read_pos {
                let tail = ring.cap - ring.write_pos;
                if tail >= need {
                    break;
                }
                // Wrap: mark the tail as waste and continue at offset 0.
                if ring.read_pos >= need && ring.cap - ring.used >= tail + need {
                    if tail >= 4 {
                        let at = ring.write_pos;
                        ring.map[at..at + 4].copy_from_slice(&WRAP_KEYHASH.to_le_bytes());
                    }
                    ring.used += tail;
                    ring.total_written += tail as u64;
                    ring.write_pos = 0;
                    break;
                }
            } else if ring.write_pos < ring.read_pos && ring.read_pos - ring.write_pos >= need {
                break;
            }
            // Full: back-pressure until the scatterer drains.
            self.shared.space.wait(&mut ring);
        }

        let at = ring.write_pos;
        ring.map[at..at + 4].copy_from_slice(&keyhash.to_le_bytes());
        ring.map[at + 4..at + 12].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        ring.map[at + 12..at + 12 + payload.len()].copy_from_slice(payload);
        ring.write_pos += need;
        ring.used += need;
        ring.total_written += need as u64;
        let total = ring.total_written;
        drop(ring);

        self.shared.watermark.send_replace(total);
        self.shared.data_ready.notify_one();
        Ok(())
    }
}

/// One record as seen by the consumer.
#[derive(Debug, PartialEq, Eq)]
pub enum OutputRecord {
    Data { keyhash: KeyHash, frame: Bytes },
    Eof,
}

/// Consumer handle, owned by the scatterer.
pub struct OutputCursor {
    stage: Stage,
    shared: Arc<Shared>,
    watermark: watch::Receiver<u64>,
    total_read: u64,
}

impl OutputCursor {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// True when the producer has published bytes this cursor has not
    /// consumed yet.
    pub fn has_pending(&self) -> bool {
        *self.watermark.borrow() > self.total_read
    }

    /// Pop the next record, if one is available.
    pub fn try_next(&mut self) -> Option<OutputRecord> {
        if !self.has_pending() {
            return None;
        }
        let mut ring = self.shared.ring.lock();
        loop {
            if ring.used == 0 {
                return None;
            }
            let tail = ring.cap - ring.read_pos;
            if tail < 4 {
                ring.used -= tail;
                ring.read_pos = 0;
                self.total_read += tail as u64;
                continue;
            }
            let keyhash = ring.read_u32(ring.read_pos);
            if keyhash == WRAP_KEYHASH {
                ring.used -= tail;
                ring.read_pos = 0;
                self.total_read += tail as u64;
                continue;
            }
            let len = ring.read_u64(ring.read_pos + 4) as usize;
            let frame =
                Bytes::copy_from_slice(&ring.map[ring.read_pos + 12..ring.read_pos + 12 + len]);
            let need = HEADER + len;
            ring.read_pos += need;
            ring.used -= need;
            self.total_read += need as u64;
            drop(ring);
            self.shared.space.notify_all();
            return Some(if keyhash == EOF_KEYHASH {
                OutputRecord::Eof
            } else {
                OutputRecord::Data { keyhash, frame }
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/output_buffer_tests.rs"]
mod output_buffer_tests;
