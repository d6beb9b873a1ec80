// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The peer daemon: one per participating host. Advertises itself in
//! the shared directory, spawns worker processes on demand, and hosts
//! the client-facing `/execute` submission endpoint.

use std::{
    ffi::OsString,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    body::StreamBody,
    extract::{Extension, Form},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use bytes::Bytes;
use config::Parameters;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::oneshot,
    time::timeout,
};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{debug, error, info, warn};
use types::{PeerRequest, PeerResponse, PeerStat, TaskSpec};

use crate::coordinator::Coordinator;
use network::{directory, prefix_frame, rpc_router, spawn_server, RpcService, ServerHandle};

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Failed to bind: {0}")]
    Bind(String),
    #[error("Malformed task spec: {0}")]
    BadSpec(#[from] types::TaskSpecError),
    #[error("A worker for task '{0}' is already running")]
    AlreadyRunning(String),
    #[error("Failed to spawn a worker: {0}")]
    SpawnFailed(String),
    #[error("Directory error: {0}")]
    Directory(#[from] std::io::Error),
}

struct WorkerProcess {
    url: String,
    pid: u32,
    kill: oneshot::Sender<()>,
}

struct PeerInner {
    coordinators: Vec<String>,
    counter: u64,
    workers: std::collections::HashMap<String, WorkerProcess>,
}

pub struct Peer {
    hostname: String,
    peer_id: u64,
    directory: PathBuf,
    directory_entry: Mutex<Option<PathBuf>>,
    parameters: Parameters,
    parameters_path: Option<PathBuf>,
    start_time: Instant,
    url: Mutex<String>,
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// Bind the peer server and advertise it in the directory.
    pub async fn spawn(
        hostname: &str,
        port: u16,
        directory: PathBuf,
        parameters: Parameters,
        parameters_path: Option<PathBuf>,
    ) -> Result<(Arc<Self>, ServerHandle), PeerError> {
        let peer = Arc::new(Self {
            hostname: hostname.to_string(),
            peer_id: rand::random::<u32>() as u64,
            directory,
            directory_entry: Mutex::new(None),
            parameters,
            parameters_path,
            start_time: Instant::now(),
            url: Mutex::new(String::new()),
            inner: Mutex::new(PeerInner {
                coordinators: Vec::new(),
                counter: 0,
                workers: std::collections::HashMap::new(),
            }),
        });

        let app = rpc_router(peer.clone()).merge(
            Router::new()
                .route("/execute", post(execute_handler))
                .layer(Extension(peer.clone())),
        );
        let address = tokio::net::lookup_host((hostname, port))
            .await
            .map_err(|e| PeerError::Bind(e.to_string()))?
            .next()
            .ok_or_else(|| PeerError::Bind(format!("cannot resolve '{hostname}'")))?;
        let server = spawn_server(address, app).map_err(|e| PeerError::Bind(e.to_string()))?;

        let url = format!("http://{}:{}", hostname, server.addr.port());
        *peer.url.lock() = url.clone();
        let entry = directory::register(&peer.directory, hostname, server.addr.port(), &url)?;
        *peer.directory_entry.lock() = Some(entry);
        info!("Peer {} listening on {url}", peer.peer_id);
        Ok((peer, server))
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    fn list_peers(&self) -> Result<Vec<String>, PeerError> {
        Ok(directory::list(&self.directory)?)
    }

    /// Spawn a worker process for `task_id`. The child re-executes this
    /// binary in worker mode with a clean environment taken from the
    /// task spec; its first stdout line must be the worker's RPC url.
    async fn start_worker(self: &Arc<Self>, task_id: String, spec: Bytes) -> Result<String, PeerError> {
        let spec = TaskSpec::from_bytes(&spec)?;
        if self.inner.lock().workers.contains_key(&task_id) {
            return Err(PeerError::AlreadyRunning(task_id));
        }

        let exe =
            std::env::current_exe().map_err(|e| PeerError::SpawnFailed(e.to_string()))?;
        let mut command = Command::new(exe);
        command.arg(format!("--worker={}", self.hostname));
        if let Some(path) = &self.parameters_path {
            command.arg("--parameters").arg(path);
        }
        command.arg(&spec.program);
        for arg in &spec.args {
            command.arg(to_os(arg));
        }
        command.env_clear();
        for (key, value) in &spec.env {
            command.env(to_os(key), to_os(value));
        }
        command
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!("Spawning a worker for task {task_id}");
        let mut child = command
            .spawn()
            .map_err(|e| PeerError::SpawnFailed(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PeerError::SpawnFailed("no stdout pipe".to_string()))?;

        // The worker announces its RPC url as the first stdout line.
        let grace = Duration::from_millis(self.parameters.spawn_timeout_ms);
        let mut lines = BufReader::new(stdout).lines();
        let url = match timeout(grace, lines.next_line()).await {
            Ok(Ok(Some(line))) if !line.trim().is_empty() => line.trim().to_string(),
            Ok(Ok(_)) => {
                let _ = child.kill().await;
                return Err(PeerError::SpawnFailed(
                    "worker exited without announcing its url".to_string(),
                ));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(PeerError::SpawnFailed(e.to_string()));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(PeerError::SpawnFailed(format!(
                    "worker did not announce its url within {grace:?}"
                )));
            }
        };
        let pid = child.id().unwrap_or_default();
        info!("Worker for task {task_id} is up at {url} (pid {pid})");

        let (tx_kill, mut rx_kill) = oneshot::channel();
        self.inner.lock().workers.insert(
            task_id.clone(),
            WorkerProcess {
                url: url.clone(),
                pid,
                kill: tx_kill,
            },
        );

        // Monitor the process and drop the bookkeeping once it exits.
        let peer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => info!("Worker for task {task_id} (pid {pid}) exited: {status}"),
                    Err(e) => warn!("Failed to await worker for task {task_id}: {e}"),
                },
                _ = &mut rx_kill => {
                    let _ = child.kill().await;
                    info!("Terminated worker for task {task_id} (pid {pid})");
                }
            }
            peer.inner.lock().workers.remove(&task_id);
        });
        Ok(url)
    }

    /// The client-facing submission path: create a coordinator for the
    /// job and return its progress stream.
    pub async fn execute(
        self: &Arc<Self>,
        spec: Bytes,
        data: Bytes,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<types::Progress>, PeerError> {
        let spec = TaskSpec::from_bytes(&spec)?;
        let task_id = {
            let mut inner = self.inner.lock();
            let task_id = format!("{}.{}", self.peer_id, inner.counter);
            inner.counter += 1;
            inner.coordinators.push(task_id.clone());
            task_id
        };
        info!("Executing task {task_id}: {spec:?}");

        let (coordinator, progress, finished) = Coordinator::new(
            task_id.clone(),
            spec,
            data,
            &self.url(),
            self.hostname.clone(),
            self.parameters.clone(),
        );
        let address = tokio::net::lookup_host((self.hostname.as_str(), 0))
            .await
            .map_err(|e| PeerError::Bind(e.to_string()))?
            .next()
            .ok_or_else(|| PeerError::Bind("cannot resolve coordinator host".to_string()))?;
        let server = spawn_server(address, rpc_router(coordinator.clone()))
            .map_err(|e| PeerError::Bind(e.to_string()))?;
        coordinator.set_server(server);

        tokio::spawn(coordinator.clone().start());

        // Drop the bookkeeping entry once the job reaches a terminal
        // state.
        let peer = self.clone();
        tokio::spawn(async move {
            let _ = finished.await;
            peer.inner.lock().coordinators.retain(|id| id != &task_id);
            debug!("Done running task {}", coordinator.task_id());
        });
        Ok(progress)
    }

    /// Terminate any worker processes still alive (peer shutdown path).
    pub fn cleanup(&self) {
        if let Some(entry) = self.directory_entry.lock().take() {
            directory::unregister(&entry);
        }
        let workers = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.workers)
        };
        for (task_id, process) in workers {
            info!(
                "Terminating worker {} for task {task_id} (pid {})",
                process.url, process.pid
            );
            let _ = process.kill.send(());
        }
    }

    fn stat(&self) -> PeerStat {
        let inner = self.inner.lock();
        PeerStat {
            peer_id: self.peer_id,
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            n_coordinators: inner.coordinators.len(),
            n_workers: inner.workers.len(),
            worker_pids: inner.workers.values().map(|w| w.pid).collect(),
        }
    }
}

#[cfg(unix)]
fn to_os(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes.to_vec())
}

#[cfg(not(unix))]
fn to_os(bytes: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(bytes).into_owned())
}

#[async_trait]
impl RpcService for Peer {
    type Request = PeerRequest;
    type Response = PeerResponse;

    async fn handle(self: Arc<Self>, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::ListPeers => match self.list_peers() {
                Ok(peers) => PeerResponse::Peers(peers),
                Err(e) => PeerResponse::Error(e.to_string()),
            },
            PeerRequest::StartWorker { task_id, spec } => {
                match self.start_worker(task_id, spec).await {
                    Ok(url) => PeerResponse::WorkerStarted { url },
                    Err(e) => PeerResponse::Error(e.to_string()),
                }
            }
            PeerRequest::Stat => PeerResponse::Stat(self.stat()),
        }
    }
}

#[derive(Deserialize)]
struct Submission {
    spec: String,
    data: String,
}

/// `POST /execute`: base64 form fields in, a chunked stream of
/// length-framed progress records out.
async fn execute_handler(
    Extension(peer): Extension<Arc<Peer>>,
    Form(submission): Form<Submission>,
) -> impl IntoResponse {
    let spec = match base64::decode(&submission.spec) {
        Ok(spec) => Bytes::from(spec),
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad spec field: {e}")).into_response(),
    };
    let data = match base64::decode(&submission.data) {
        Ok(data) => Bytes::from(data),
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad data field: {e}")).into_response(),
    };
    match peer.execute(spec, data).await {
        Ok(progress) => {
            let stream = UnboundedReceiverStream::new(progress).map(|message| {
                let encoded =
                    bincode::serialize(&message).expect("serializing progress cannot fail");
                Ok::<_, std::convert::Infallible>(prefix_frame(&encoded))
            });
            StreamBody::new(stream).into_response()
        }
        Err(e) => {
            error!("Submission failed: {e}");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
#[path = "tests/peer_tests.rs"]
mod peer_tests;
