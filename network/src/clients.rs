// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use types::{
    CoordinatorRequest, CoordinatorResponse, CoordinatorStat, KeyHash, PeerRequest, PeerResponse,
    PeerStat, Stage, WorkerRequest, WorkerResponse, WorkerStat,
};

use crate::rpc::{RpcClient, RpcError};

fn unexpected<T>(what: &str) -> Result<T, RpcError> {
    Err(RpcError::Protocol(format!("unexpected {what} response")))
}

/// Typed proxy to a peer daemon.
#[derive(Clone)]
pub struct PeerClient {
    rpc: RpcClient,
}

impl PeerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            rpc: RpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.rpc.url()
    }

    pub async fn list_peers(&self) -> Result<Vec<String>, RpcError> {
        match self.rpc.call(&PeerRequest::ListPeers).await? {
            PeerResponse::Peers(peers) => Ok(peers),
            PeerResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("peer"),
        }
    }

    pub async fn start_worker(&self, task_id: &str, spec: Bytes) -> Result<String, RpcError> {
        let request = PeerRequest::StartWorker {
            task_id: task_id.to_string(),
            spec,
        };
        match self.rpc.call(&request).await? {
            PeerResponse::WorkerStarted { url } => Ok(url),
            PeerResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("peer"),
        }
    }

    pub async fn stat(&self) -> Result<PeerStat, RpcError> {
        match self.rpc.call(&PeerRequest::Stat).await? {
            PeerResponse::Stat(stat) => Ok(stat),
            PeerResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("peer"),
        }
    }
}

/// Typed proxy to a job coordinator.
#[derive(Clone)]
pub struct CoordinatorClient {
    rpc: RpcClient,
}

impl CoordinatorClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            rpc: RpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.rpc.url()
    }

    pub async fn get_destinations(
        &self,
        stage: Stage,
        keyhash: KeyHash,
    ) -> Result<Vec<(KeyHash, String)>, RpcError> {
        let request = CoordinatorRequest::GetDestinations { stage, keyhash };
        match self.rpc.call(&request).await? {
            CoordinatorResponse::Destinations(map) => Ok(map),
            CoordinatorResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("coordinator"),
        }
    }

    pub async fn stage_thread_ended(&self, worker_url: &str, stage: Stage) -> Result<(), RpcError> {
        self.ack(CoordinatorRequest::StageThreadEnded {
            worker_url: worker_url.to_string(),
            stage,
        })
        .await
    }

    pub async fn stage_ended(&self, worker_url: &str, stage: Stage) -> Result<(), RpcError> {
        self.ack(CoordinatorRequest::StageEnded {
            worker_url: worker_url.to_string(),
            stage,
        })
        .await
    }

    pub async fn notify_client_of_result(&self, url: &str) -> Result<(), RpcError> {
        self.ack(CoordinatorRequest::NotifyClientOfResult {
            url: url.to_string(),
        })
        .await
    }

    pub async fn report_failure(&self, worker_url: &str, message: &str) -> Result<(), RpcError> {
        self.ack(CoordinatorRequest::ReportFailure {
            worker_url: worker_url.to_string(),
            message: message.to_string(),
        })
        .await
    }

    pub async fn stat(&self) -> Result<CoordinatorStat, RpcError> {
        match self.rpc.call(&CoordinatorRequest::Stat).await? {
            CoordinatorResponse::Stat(stat) => Ok(stat),
            CoordinatorResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("coordinator"),
        }
    }

    async fn ack(&self, request: CoordinatorRequest) -> Result<(), RpcError> {
        match self.rpc.call(&request).await? {
            CoordinatorResponse::Ack => Ok(()),
            CoordinatorResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("coordinator"),
        }
    }
}

/// Typed proxy to a worker.
#[derive(Clone)]
pub struct WorkerClient {
    rpc: RpcClient,
}

impl WorkerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            rpc: RpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.rpc.url()
    }

    pub async fn initialize(&self, coordinator_url: &str, payload: Bytes) -> Result<(), RpcError> {
        self.ack(WorkerRequest::Initialize {
            coordinator_url: coordinator_url.to_string(),
            payload,
        })
        .await
    }

    pub async fn run_stage(&self, stage: Stage, maxpeers: u32) -> Result<(), RpcError> {
        self.ack(WorkerRequest::RunStage { stage, maxpeers }).await
    }

    pub async fn stage_ended(&self, stage: Stage) -> Result<(), RpcError> {
        self.ack(WorkerRequest::StageEnded { stage }).await
    }

    pub async fn gatherer_addr(&self) -> Result<(String, u16), RpcError> {
        match self.rpc.call(&WorkerRequest::GathererAddr).await? {
            WorkerResponse::GathererAddr { host, port } => Ok((host, port)),
            WorkerResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("worker"),
        }
    }

    pub async fn shutdown(&self) -> Result<(), RpcError> {
        self.ack(WorkerRequest::Shutdown).await
    }

    pub async fn stat(&self) -> Result<WorkerStat, RpcError> {
        match self.rpc.call(&WorkerRequest::Stat).await? {
            WorkerResponse::Stat(stat) => Ok(stat),
            WorkerResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("worker"),
        }
    }

    async fn ack(&self, request: WorkerRequest) -> Result<(), RpcError> {
        match self.rpc.call(&request).await? {
            WorkerResponse::Ack => Ok(()),
            WorkerResponse::Error(e) => Err(RpcError::Remote(e)),
            _ => unexpected("worker"),
        }
    }
}
