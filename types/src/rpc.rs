// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{KeyHash, Stage};

/// Requests served by a peer daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Read the shared directory and return the urls of all live peers.
    ListPeers,
    /// Spawn a worker process for the given task. The reply carries the
    /// worker's RPC url, read from the first line of its stdout.
    StartWorker { task_id: String, spec: Bytes },
    Stat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    Peers(Vec<String>),
    WorkerStarted { url: String },
    Stat(PeerStat),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStat {
    pub peer_id: u64,
    pub uptime_ms: u64,
    pub n_coordinators: usize,
    pub n_workers: usize,
    /// OS pids of the worker processes this peer currently hosts.
    pub worker_pids: Vec<u32>,
}

/// Requests served by a job coordinator.
///
/// `StageEnded` follows the producer-stage convention: a worker reports
/// `stage` once all its `stage` threads have exited AND every downstream
/// gatherer acknowledged the stage+1 data it sent. The ack frame itself
/// names the destination stage; the report names its producer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorRequest {
    /// Ask where `(stage, keyhash)` traffic must be sent. The reply is
    /// the full mapping known for the stage so the caller can cache
    /// future placements without another round trip.
    GetDestinations { stage: Stage, keyhash: KeyHash },
    StageThreadEnded { worker_url: String, stage: Stage },
    StageEnded { worker_url: String, stage: Stage },
    NotifyClientOfResult { url: String },
    /// A worker-side fatal condition (e.g. a kernel panic). Aborts the
    /// job with a terminal progress message.
    ReportFailure { worker_url: String, message: String },
    Stat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorResponse {
    Destinations(Vec<(KeyHash, String)>),
    Ack,
    Stat(CoordinatorStat),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStat {
    pub task_id: String,
    pub uptime_ms: u64,
    pub n_workers: usize,
}

/// Requests served by a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// One-time setup: connect back to the coordinator, decode the kernel
    /// chain and locals from the head of `payload`, and seed the feeder
    /// buffer with the remaining item bytes. Must not call back into the
    /// coordinator.
    Initialize {
        coordinator_url: String,
        payload: Bytes,
    },
    /// Start one kernel thread for `stage`. `maxpeers` fixes the routing
    /// modulus of stage+1.
    RunStage { stage: Stage, maxpeers: u32 },
    /// The coordinator announces the global end of `stage`: the local
    /// buffer for stage+1 will receive no more data.
    StageEnded { stage: Stage },
    GathererAddr,
    Shutdown,
    Stat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    Ack,
    GathererAddr { host: String, port: u16 },
    Stat(WorkerStat),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStat {
    pub url: String,
    pub uptime_ms: u64,
    pub running: Vec<(Stage, usize)>,
}
