// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use async_trait::async_trait;
use config::Parameters;
use std::time::Duration;
use tokio::time::timeout;

use crate::gatherer::Gatherer;
use crate::output_buffer::{Bypass, OutputBuffer};
use network::{rpc_router, spawn_server, RpcService};
use types::{
    hash_key, CoordinatorRequest, CoordinatorResponse, WorkerRequest, WorkerResponse,
};

/// Answers `GathererAddr` with a fixed address, standing in for the
/// destination worker.
struct FakeWorker {
    addr: Addr,
}

#[async_trait]
impl RpcService for FakeWorker {
    type Request = WorkerRequest;
    type Response = WorkerResponse;

    async fn handle(self: Arc<Self>, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::GathererAddr => WorkerResponse::GathererAddr {
                host: self.addr.0.clone(),
                port: self.addr.1,
            },
            _ => WorkerResponse::Error("unexpected request".to_string()),
        }
    }
}

/// Routes every keyhash to a single worker and records barrier calls.
struct FakeCoordinator {
    worker_url: String,
    events: mpsc::Sender<CoordinatorRequest>,
}

#[async_trait]
impl RpcService for FakeCoordinator {
    type Request = CoordinatorRequest;
    type Response = CoordinatorResponse;

    async fn handle(self: Arc<Self>, request: CoordinatorRequest) -> CoordinatorResponse {
        match request {
            CoordinatorRequest::GetDestinations { keyhash, .. } => {
                CoordinatorResponse::Destinations(vec![(keyhash, self.worker_url.clone())])
            }
            other => {
                self.events.send(other).await.unwrap();
                CoordinatorResponse::Ack
            }
        }
    }
}

struct Fixture {
    gatherer: Arc<Gatherer>,
    handle: ScattererHandle,
    events: mpsc::Receiver<CoordinatorRequest>,
    _servers: Vec<network::ServerHandle>,
}

async fn fixture(self_is_destination: bool) -> Fixture {
    let parameters = Parameters::default();
    let gatherer = Gatherer::spawn("127.0.0.1", &parameters).await.unwrap();

    let fake_worker = Arc::new(FakeWorker {
        addr: gatherer.addr(),
    });
    let worker_server = spawn_server("127.0.0.1:0".parse().unwrap(), rpc_router(fake_worker)).unwrap();
    let worker_url = format!("http://{}", worker_server.addr);

    let (tx_events, events) = mpsc::channel(16);
    let fake_coordinator = Arc::new(FakeCoordinator {
        worker_url,
        events: tx_events,
    });
    let coordinator_server =
        spawn_server("127.0.0.1:0".parse().unwrap(), rpc_router(fake_coordinator)).unwrap();

    let self_addr = if self_is_destination {
        gatherer.addr()
    } else {
        ("127.0.0.1".to_string(), 1)
    };
    let handle = Scatterer::spawn(
        "http://source-worker".to_string(),
        &format!("http://{}", coordinator_server.addr),
        self_addr,
        parameters.channel_capacity,
    );

    Fixture {
        gatherer,
        handle,
        events,
        _servers: vec![worker_server, coordinator_server],
    }
}

fn output_for(handle: &ScattererHandle, stage: Stage, bypass: Option<Bypass>) -> OutputBuffer {
    let (producer, cursor) =
        OutputBuffer::new(stage, 4, 1024 * 1024, handle.data_ready(), bypass).unwrap();
    let control = handle.control();
    tokio::spawn(async move {
        let _ = control.send(ScattererCommand::Buffer(cursor)).await;
    });
    producer
}

fn data_key(n: u64) -> Bytes {
    Bytes::from(bincode::serialize(&n).unwrap())
}

#[tokio::test]
async fn delivers_data_and_reports_stage_end() {
    let mut fixture = fixture(false).await;
    let output = output_for(&fixture.handle, 1, None);

    output.queue(data_key(1), Bytes::from_static(b"v1")).unwrap();
    output.queue(data_key(2), Bytes::from_static(b"v2")).unwrap();
    output.queue_eof().unwrap();

    // The ack drain must end with `stage_ended(stage - 1)`.
    let event = timeout(Duration::from_secs(5), fixture.events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        CoordinatorRequest::StageEnded { worker_url, stage } => {
            assert_eq!(worker_url, "http://source-worker");
            assert_eq!(stage, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Both values reached the destination gatherer.
    let buffer = fixture.gatherer.get_or_create_buffer(1).unwrap();
    buffer.all_received();
    let collected: Vec<(Bytes, Vec<Bytes>)> = tokio::task::spawn_blocking(move || {
        buffer.items().map(|(k, v)| (k, v.collect())).collect()
    })
    .await
    .unwrap();
    assert_eq!(collected.len(), 2);
}

#[tokio::test]
async fn empty_stage_completes_without_channels() {
    let mut fixture = fixture(false).await;
    let output = output_for(&fixture.handle, 2, None);

    // The kernel emitted nothing: EOF is the only record.
    output.queue_eof().unwrap();

    let event = timeout(Duration::from_secs(5), fixture.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(event, CoordinatorRequest::StageEnded { stage: 1, .. }),
        "got {event:?}"
    );
}

#[tokio::test]
async fn local_destinations_are_recorded_for_bypass() {
    let mut fixture = fixture(true).await;
    let output = output_for(&fixture.handle, 1, None);

    let key = data_key(7);
    let keyhash = hash_key(4, &key);
    output.queue(key, Bytes::from_static(b"v")).unwrap();
    output.queue_eof().unwrap();

    timeout(Duration::from_secs(5), fixture.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        fixture.handle.local_destinations().contains(&(1, keyhash)),
        "the self-addressed destination must enter the bypass set"
    );
}

#[tokio::test]
async fn bypassed_traffic_skips_tcp_but_reaches_the_buffer() {
    let mut fixture = fixture(true).await;
    let bypass = Bypass {
        gatherer: fixture.gatherer.clone(),
        local: fixture.handle.local_destinations(),
    };
    let output = output_for(&fixture.handle, 1, Some(bypass));

    let key = data_key(9);
    // First record travels over TCP and registers the bypass.
    output.queue(key.clone(), Bytes::from_static(b"first")).unwrap();
    let keyhash = hash_key(4, &key);
    while !fixture.handle.local_destinations().contains(&(1, keyhash)) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Subsequent records take the direct path.
    output.queue(key.clone(), Bytes::from_static(b"second")).unwrap();
    output.queue_eof().unwrap();

    timeout(Duration::from_secs(5), fixture.events.recv())
        .await
        .unwrap()
        .unwrap();

    let buffer = fixture.gatherer.get_or_create_buffer(1).unwrap();
    buffer.all_received();
    let collected: Vec<Vec<Bytes>> = tokio::task::spawn_blocking(move || {
        buffer.items().map(|(_, v)| v.collect()).collect()
    })
    .await
    .unwrap();
    let total: usize = collected.iter().map(|values| values.len()).sum();
    assert_eq!(total, 2);
}
