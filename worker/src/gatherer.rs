// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The gatherer: a listen socket plus one task per connected scatterer,
//! funneling incoming `(key, value)` pairs into per-stage buffers.

use std::{
    collections::HashMap,
    error::Error,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use config::Parameters;
use futures::SinkExt;
use parking_lot::Mutex;
use tracing::debug;
use types::{Frame, Stage};

use crate::buffer::{BufferError, GatherBuffer, Items};
use network::{MessageHandler, Receiver, Writer};

pub struct Gatherer {
    host: String,
    port: AtomicU16,
    budget: usize,
    watermark: usize,
    buffers: Mutex<HashMap<Stage, Arc<GatherBuffer>>>,
    receiver: Mutex<Option<Receiver>>,
}

impl Gatherer {
    /// Bind an ephemeral port on `host` and start accepting scatterer
    /// connections.
    pub async fn spawn(host: &str, parameters: &Parameters) -> std::io::Result<Arc<Self>> {
        let address = tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve '{host}'"),
                )
            })?;

        let gatherer = Arc::new(Self {
            host: host.to_string(),
            port: AtomicU16::new(0),
            budget: parameters.buffer_budget,
            watermark: parameters.value_watermark,
            buffers: Mutex::new(HashMap::new()),
            receiver: Mutex::new(None),
        });

        let handler = GathererHandler {
            gatherer: Arc::downgrade(&gatherer),
        };
        let receiver = Receiver::spawn(address, handler).await?;
        gatherer.port.store(receiver.addr.port(), Ordering::Release);
        *gatherer.receiver.lock() = Some(receiver);
        Ok(gatherer)
    }

    pub fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port.load(Ordering::Acquire))
    }

    pub fn get_or_create_buffer(&self, stage: Stage) -> Result<Arc<GatherBuffer>, BufferError> {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.get(&stage) {
            return Ok(buffer.clone());
        }
        debug!("Creating gather buffer for stage {stage}");
        let buffer = GatherBuffer::new(stage, self.budget, self.watermark)?;
        buffers.insert(stage, buffer.clone());
        Ok(buffer)
    }

    pub fn append(&self, stage: Stage, key: Bytes, value: &[u8]) -> Result<(), BufferError> {
        self.get_or_create_buffer(stage)?.append(key, value)
    }

    /// Blocking iterator over the keys of `stage`, for kernel threads.
    pub fn items(&self, stage: Stage) -> Result<Items, BufferError> {
        Ok(self.get_or_create_buffer(stage)?.items())
    }

    /// The coordinator announced the global end of `stage`: the buffer
    /// one stage later will receive no more data.
    pub fn stage_ended(&self, stage: Stage) -> Result<(), BufferError> {
        self.get_or_create_buffer(stage + 1)?.all_received();
        Ok(())
    }

    /// The kernel threads for `stage` are done with its buffer.
    pub fn discard(&self, stage: Stage) {
        debug!("Discarding gather buffer for stage {stage}");
        self.buffers.lock().remove(&stage);
    }

    pub fn shutdown(&self) {
        self.receiver.lock().take();
        // Wake any kernel thread still blocked on a buffer so it can
        // observe termination instead of holding up the process exit.
        let buffers: Vec<Arc<GatherBuffer>> = self.buffers.lock().drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            buffer.all_received();
        }
    }
}

#[derive(Clone)]
struct GathererHandler {
    gatherer: Weak<Gatherer>,
}

#[async_trait]
impl MessageHandler for GathererHandler {
    async fn dispatch(&self, writer: &mut Writer, message: Bytes) -> Result<(), Box<dyn Error>> {
        let gatherer = match self.gatherer.upgrade() {
            Some(gatherer) => gatherer,
            None => return Err("gatherer is gone".into()),
        };
        match Frame::decode(&message)? {
            Frame::Data { stage, key, value } => {
                gatherer.append(stage, key, &value)?;
            }
            Frame::AckDone { stage } => {
                // Everything sent before this frame is already buffered:
                // acknowledge on the same connection.
                debug!("Acknowledging end of data for stage {stage}");
                writer.send(Frame::AckDone { stage }.encode()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/gatherer_tests.rs"]
mod gatherer_tests;
