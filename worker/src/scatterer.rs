// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The scatterer: one task per worker owning all outbound channels. It
//! drains records from the output buffers, resolves their destinations
//! through the coordinator (caching the full mapping it returns), and
//! forwards every record to the channel of the worker owning its key.
//!
//! End-of-stage protocol: once every local producer for a destination
//! stage has queued EOF, an `AckDone` frame is broadcast on all channels
//! that carried data for that stage. Each gatherer echoes the frame once
//! everything before it is buffered; when the last echo arrives the
//! coordinator is told that stage-1 (the producer stage) has ended on
//! this worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use futures::SinkExt;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};
use types::{Frame, KeyHash, Stage};

use crate::output_buffer::{OutputCursor, OutputRecord};
use network::{wire_codec, CoordinatorClient, RpcError, WorkerClient};

/// A destination gatherer address.
type Addr = (String, u16);

pub enum ScattererCommand {
    /// Register a freshly created output buffer.
    Buffer(OutputCursor),
    Shutdown,
}

enum ChannelEvent {
    Ack { addr: Addr, stage: Stage },
    Closed { addr: Addr, reason: String },
}

/// The connection task exits on its own once the last sender is dropped.
struct ScatterChannel {
    tx: mpsc::Sender<Bytes>,
}

/// Handle kept by the worker; the scatterer itself runs as a task.
pub struct ScattererHandle {
    tx_control: mpsc::Sender<ScattererCommand>,
    data_ready: Arc<Notify>,
    local: Arc<DashSet<(Stage, KeyHash)>>,
    handle: JoinHandle<()>,
}

impl ScattererHandle {
    pub fn data_ready(&self) -> Arc<Notify> {
        self.data_ready.clone()
    }

    /// Cheap handle for cross-thread control messages.
    pub fn control(&self) -> mpsc::Sender<ScattererCommand> {
        self.tx_control.clone()
    }

    /// Set of `(stage, keyhash)` pairs whose destination is this very
    /// worker; consulted by output buffers for the TCP bypass.
    pub fn local_destinations(&self) -> Arc<DashSet<(Stage, KeyHash)>> {
        self.local.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.tx_control.send(ScattererCommand::Shutdown).await;
        let _ = self.handle.await;
    }
}

pub struct Scatterer {
    worker_url: String,
    coordinator: CoordinatorClient,
    self_addr: Addr,
    channel_capacity: usize,

    rx_control: mpsc::Receiver<ScattererCommand>,
    tx_event: mpsc::Sender<ChannelEvent>,
    rx_event: mpsc::Receiver<ChannelEvent>,
    data_ready: Arc<Notify>,
    local: Arc<DashSet<(Stage, KeyHash)>>,

    /// Output buffers still producing, per destination stage.
    buffers: HashMap<Stage, Vec<OutputCursor>>,
    /// Client-side cache of the coordinator's destination mapping.
    known: HashMap<Stage, HashMap<KeyHash, String>>,
    /// Cache of worker-url -> gatherer address lookups.
    addr_cache: HashMap<String, Addr>,
    route: HashMap<(Stage, KeyHash), Addr>,
    channels: HashMap<Addr, ScatterChannel>,
    /// Channels that carried data for a stage and still owe an ack.
    by_stage: HashMap<Stage, HashSet<Addr>>,
}

impl Scatterer {
    pub fn spawn(
        worker_url: String,
        coordinator_url: &str,
        self_addr: Addr,
        channel_capacity: usize,
    ) -> ScattererHandle {
        let (tx_control, rx_control) = mpsc::channel(128);
        let (tx_event, rx_event) = mpsc::channel(128);
        let data_ready = Arc::new(Notify::new());
        let local = Arc::new(DashSet::new());
        let scatterer = Self {
            worker_url,
            coordinator: CoordinatorClient::new(coordinator_url),
            self_addr,
            channel_capacity,
            rx_control,
            tx_event,
            rx_event,
            data_ready: data_ready.clone(),
            local: local.clone(),
            buffers: HashMap::new(),
            known: HashMap::new(),
            addr_cache: HashMap::new(),
            route: HashMap::new(),
            channels: HashMap::new(),
            by_stage: HashMap::new(),
        };
        let handle = tokio::spawn(scatterer.run());
        ScattererHandle {
            tx_control,
            data_ready,
            local,
            handle,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.rx_control.recv() => match command {
                    Some(ScattererCommand::Buffer(cursor)) => {
                        self.buffers.entry(cursor.stage()).or_default().push(cursor);
                    }
                    Some(ScattererCommand::Shutdown) | None => break,
                },
                Some(event) = self.rx_event.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        self.fail(e).await;
                        break;
                    }
                }
                _ = self.data_ready.notified() => {}
            }
            if let Err(e) = self.pump().await {
                self.fail(e).await;
                break;
            }
        }
        debug!("Scatterer on {} exiting", self.worker_url);
        self.channels.clear();
    }

    /// Fatal condition: report to the coordinator (best effort) so the
    /// job aborts with a terminal message.
    async fn fail(&self, error: ScatterError) {
        error!("Scatterer on {} failed: {error}", self.worker_url);
        if let ScatterError::Rpc(_) = error {
            // The coordinator is the unreachable party; nothing to tell.
            return;
        }
        let _ = self
            .coordinator
            .report_failure(&self.worker_url, &error.to_string())
            .await;
    }

    /// Move available records from the output buffers to the channels.
    /// Consumption per buffer per round is bounded for fairness; a
    /// buffer left non-empty re-arms the wakeup.
    async fn pump(&mut self) -> Result<(), ScatterError> {
        const FAIRNESS: usize = 10;
        let stages: Vec<Stage> = self.buffers.keys().copied().collect();
        for stage in stages {
            let mut cursors = self.buffers.remove(&stage).unwrap_or_default();
            let mut stage_done = false;
            let mut more = false;
            let mut remaining = Vec::new();
            for mut cursor in cursors.drain(..) {
                let mut eof = false;
                for _ in 0..FAIRNESS {
                    match cursor.try_next() {
                        Some(OutputRecord::Data { keyhash, frame }) => {
                            self.forward(stage, keyhash, frame).await?;
                        }
                        Some(OutputRecord::Eof) => {
                            eof = true;
                            break;
                        }
                        None => break,
                    }
                }
                if eof {
                    // EOF is queued by the last kernel thread of the
                    // producer stage: every sibling buffer is already
                    // quiescent, so drain them to completion below.
                    stage_done = true;
                } else {
                    more |= cursor.has_pending();
                    remaining.push(cursor);
                }
            }
            if stage_done {
                for mut cursor in remaining.drain(..) {
                    while let Some(record) = cursor.try_next() {
                        if let OutputRecord::Data { keyhash, frame } = record {
                            self.forward(stage, keyhash, frame).await?;
                        }
                    }
                }
                self.finish_stage(stage).await?;
            } else if !remaining.is_empty() {
                self.buffers.insert(stage, remaining);
                if more {
                    self.data_ready.notify_one();
                }
            }
        }
        Ok(())
    }

    async fn forward(
        &mut self,
        stage: Stage,
        keyhash: KeyHash,
        frame: Bytes,
    ) -> Result<(), ScatterError> {
        let addr = match self.route.get(&(stage, keyhash)) {
            Some(addr) => addr.clone(),
            None => self.resolve(stage, keyhash).await?,
        };
        let tx = self
            .channels
            .get(&addr)
            .map(|channel| channel.tx.clone())
            .expect("routed channels exist");
        tx.send(frame).await.map_err(|_| ScatterError::Channel {
            addr: addr.clone(),
            reason: "send queue closed".to_string(),
        })
    }

    /// Resolve where `(stage, keyhash)` traffic goes, querying the
    /// coordinator on a cache miss and opening the channel if needed.
    async fn resolve(&mut self, stage: Stage, keyhash: KeyHash) -> Result<Addr, ScatterError> {
        let cached = self
            .known
            .get(&stage)
            .and_then(|map| map.get(&keyhash))
            .cloned();
        let worker_url = match cached {
            Some(url) => url,
            None => {
                debug!("Querying destinations for stage {stage} keyhash {keyhash}");
                let mapping = self.coordinator.get_destinations(stage, keyhash).await?;
                let map = self.known.entry(stage).or_default();
                map.extend(mapping);
                map.get(&keyhash)
                    .cloned()
                    .ok_or_else(|| ScatterError::NoDestination { stage, keyhash })?
            }
        };

        let addr = match self.addr_cache.get(&worker_url) {
            Some(addr) => addr.clone(),
            None => {
                let addr = WorkerClient::new(&worker_url).gatherer_addr().await?;
                self.addr_cache.insert(worker_url.clone(), addr.clone());
                addr
            }
        };

        if addr == self.self_addr {
            debug!("Destination of stage {stage} keyhash {keyhash} is local");
            self.local.insert((stage, keyhash));
        }

        if !self.channels.contains_key(&addr) {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            tokio::spawn(run_channel(addr.clone(), rx, self.tx_event.clone()));
            self.channels.insert(addr.clone(), ScatterChannel { tx });
        }
        self.by_stage.entry(stage).or_default().insert(addr.clone());
        self.route.insert((stage, keyhash), addr.clone());
        Ok(addr)
    }

    /// All local producers for `stage` are done: request an ack on every
    /// channel that carried its data. A stage that never used a channel
    /// completes immediately.
    async fn finish_stage(&mut self, stage: Stage) -> Result<(), ScatterError> {
        let addrs: Vec<Addr> = self
            .by_stage
            .get(&stage)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if addrs.is_empty() {
            return self.all_acknowledged(stage).await;
        }
        let ack = Frame::AckDone { stage }.encode();
        for addr in addrs {
            let tx = self.channels.get(&addr).map(|c| c.tx.clone());
            if let Some(tx) = tx {
                tx.send(ack.clone()).await.map_err(|_| ScatterError::Channel {
                    addr,
                    reason: "send queue closed".to_string(),
                })?;
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ChannelEvent) -> Result<(), ScatterError> {
        match event {
            ChannelEvent::Ack { addr, stage } => {
                debug!("Got ack for stage {stage} from {addr:?}");
                if let Some(pending) = self.by_stage.get_mut(&stage) {
                    pending.remove(&addr);
                    if pending.is_empty() {
                        self.all_acknowledged(stage).await?;
                    }
                }
                Ok(())
            }
            ChannelEvent::Closed { addr, reason } => Err(ScatterError::Channel { addr, reason }),
        }
    }

    /// Every gatherer acknowledged `stage`'s data: this worker is
    /// completely done with the stage that produced it.
    async fn all_acknowledged(&mut self, stage: Stage) -> Result<(), ScatterError> {
        debug!("All gatherers acknowledged data for stage {stage}");
        self.by_stage.remove(&stage);
        self.route.retain(|(s, _), _| *s != stage);

        // Close channels that no longer serve any stage.
        let live: HashSet<Addr> = self
            .by_stage
            .values()
            .flat_map(|set| set.iter().cloned())
            .chain(self.route.values().cloned())
            .collect();
        self.channels.retain(|addr, _| live.contains(addr));

        self.coordinator
            .stage_ended(&self.worker_url, stage - 1)
            .await?;
        Ok(())
    }
}

/// One outbound connection. Sends queued frames; forwards ack echoes
/// back to the scatterer.
async fn run_channel(addr: Addr, mut rx: mpsc::Receiver<Bytes>, tx_event: mpsc::Sender<ChannelEvent>) {
    let stream = match TcpStream::connect(addr.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx_event
                .send(ChannelEvent::Closed {
                    addr,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };
    let mut transport = Framed::new(stream, wire_codec());
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = transport.send(frame).await {
                        let _ = tx_event.send(ChannelEvent::Closed { addr, reason: e.to_string() }).await;
                        return;
                    }
                }
                // The scatterer dropped this channel: flush and exit.
                None => {
                    let _ = transport.flush().await;
                    return;
                }
            },
            incoming = transport.next() => match incoming {
                Some(Ok(bytes)) => match Frame::decode(&bytes) {
                    Ok(Frame::AckDone { stage }) => {
                        let _ = tx_event.send(ChannelEvent::Ack { addr: addr.clone(), stage }).await;
                    }
                    Ok(_) => warn!("Unexpected data frame from gatherer {addr:?}"),
                    Err(e) => warn!("Malformed ack from {addr:?}: {e}"),
                },
                Some(Err(e)) => {
                    let _ = tx_event.send(ChannelEvent::Closed { addr, reason: e.to_string() }).await;
                    return;
                }
                None => {
                    let _ = tx_event.send(ChannelEvent::Closed { addr, reason: "connection closed".to_string() }).await;
                    return;
                }
            },
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScatterError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("Coordinator returned no destination for stage {stage} keyhash {keyhash}")]
    NoDestination { stage: Stage, keyhash: KeyHash },
    #[error("Channel to {addr:?} failed: {reason}")]
    Channel { addr: Addr, reason: String },
}

#[cfg(test)]
#[path = "tests/scatterer_tests.rs"]
mod scatterer_tests;
