// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The worker: one per (peer, job). Hosts the gatherer and scatterer,
//! runs stage kernels on dedicated OS threads, and serves the worker RPC
//! surface.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    body::StreamBody,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use config::Parameters;
use futures::StreamExt;
use kernel::{default_registry, Kernel, KernelSpec};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, Notify},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use types::{Stage, WorkerRequest, WorkerResponse, WorkerStat};

use crate::{
    gatherer::Gatherer,
    output_buffer::{Bypass, OutputBuffer},
    scatterer::{Scatterer, ScattererCommand, ScattererHandle},
};
use network::{prefix_frame, rpc_router, spawn_server, CoordinatorClient, RpcService, ServerHandle};

/// The synthetic key under which the initial items blob is injected into
/// the feeder buffer.
fn feeder_key() -> Bytes {
    encode(&0u64)
}

fn encode<T: serde::Serialize>(value: &T) -> Bytes {
    Bytes::from(bincode::serialize(value).expect("serialization cannot fail"))
}

struct WorkerState {
    coordinator: Option<CoordinatorClient>,
    kernels: Vec<Arc<dyn Kernel>>,
    // TODO: hand the locals to kernels once the kernel API grows a
    // context argument.
    #[allow(dead_code)]
    locals: Vec<Bytes>,
    gatherer: Option<Arc<Gatherer>>,
    scatterer: Option<ScattererHandle>,
    /// stage -> number of kernel threads currently running it.
    running: HashMap<Stage, usize>,
    threads: Vec<thread::JoinHandle<()>>,
}

pub struct Worker {
    hostname: String,
    url: Mutex<String>,
    parameters: Parameters,
    start_time: Instant,
    state: Mutex<WorkerState>,
    /// Fired by the shutdown RPC; the binary exits when it triggers.
    exit: Arc<Notify>,
}

impl Worker {
    /// Start the worker RPC server on an ephemeral port of `hostname`.
    pub async fn spawn(
        hostname: &str,
        parameters: Parameters,
    ) -> Result<(Arc<Self>, ServerHandle), WorkerError> {
        let worker = Arc::new(Self {
            hostname: hostname.to_string(),
            url: Mutex::new(String::new()),
            parameters,
            start_time: Instant::now(),
            state: Mutex::new(WorkerState {
                coordinator: None,
                kernels: Vec::new(),
                locals: Vec::new(),
                gatherer: None,
                scatterer: None,
                running: HashMap::new(),
                threads: Vec::new(),
            }),
            exit: Arc::new(Notify::new()),
        });

        let address = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| WorkerError::Bind(e.to_string()))?
            .next()
            .ok_or_else(|| WorkerError::Bind(format!("cannot resolve '{hostname}'")))?;
        let server = spawn_server(address, rpc_router(worker.clone()))
            .map_err(|e| WorkerError::Bind(e.to_string()))?;
        *worker.url.lock() = format!("http://{}:{}", hostname, server.addr.port());
        info!("Worker listening on {}", worker.url());
        Ok((worker, server))
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    /// Resolves once the shutdown RPC has been served.
    pub fn exit_signal(&self) -> Arc<Notify> {
        self.exit.clone()
    }

    /// One-time job setup. Must not call back into the coordinator: the
    /// coordinator blocks on this RPC while holding its own lock.
    async fn initialize(&self, coordinator_url: String, payload: Bytes) -> Result<(), WorkerError> {
        let gatherer = Gatherer::spawn(&self.hostname, &self.parameters)
            .await
            .map_err(|e| WorkerError::Bind(e.to_string()))?;
        let scatterer = Scatterer::spawn(
            self.url(),
            &coordinator_url,
            gatherer.addr(),
            self.parameters.channel_capacity,
        );

        // The payload head carries the kernel chain and the locals; the
        // remainder is the opaque items blob for the feeder.
        let mut reader = std::io::Cursor::new(payload.as_ref());
        let (specs, locals): (Vec<KernelSpec>, Vec<Vec<u8>>) =
            bincode::deserialize_from(&mut reader).map_err(WorkerError::MalformedPayload)?;
        let items = payload.slice(reader.position() as usize..);
        let kernels = default_registry().load_chain(&specs)?;
        debug!(
            "Initialized with {} kernels, {} locals, {} item bytes",
            kernels.len(),
            locals.len(),
            items.len()
        );

        gatherer.append(-1, feeder_key(), &items)?;
        // The feeder buffer is complete the moment it is seeded.
        gatherer.get_or_create_buffer(-1)?.all_received();

        let mut state = self.state.lock();
        state.coordinator = Some(CoordinatorClient::new(&coordinator_url));
        state.kernels = kernels;
        state.locals = locals.into_iter().map(Bytes::from).collect();
        state.gatherer = Some(gatherer);
        state.scatterer = Some(scatterer);
        Ok(())
    }

    /// Start one kernel thread for `stage`. `maxpeers` fixes the routing
    /// modulus of stage+1. Must not call back into the coordinator.
    async fn run_stage(self: &Arc<Self>, stage: Stage, maxpeers: u32) -> Result<(), WorkerError> {
        let (control, scatterer_ready, bypass, nkernels) = {
            let state = self.state.lock();
            let gatherer = state.gatherer.clone().ok_or(WorkerError::NotInitialized)?;
            let scatterer = state.scatterer.as_ref().ok_or(WorkerError::NotInitialized)?;
            let bypass = if self.parameters.disable_local_bypass {
                None
            } else {
                Some(Bypass {
                    gatherer,
                    local: scatterer.local_destinations(),
                })
            };
            (
                scatterer.control(),
                scatterer.data_ready(),
                bypass,
                state.kernels.len() as Stage,
            )
        };
        if stage < -1 || stage > nkernels {
            return Err(WorkerError::BadStage(stage));
        }
        debug!("Starting stage {stage} (maxpeers {maxpeers})");

        let (output, cursor) = OutputBuffer::new(
            stage + 1,
            maxpeers,
            self.parameters.output_buffer_budget,
            scatterer_ready,
            bypass,
        )?;
        if control.send(ScattererCommand::Buffer(cursor)).await.is_err() {
            return Err(WorkerError::NotInitialized);
        }

        // Count the thread before it can possibly report its own end.
        self.state.lock().running.entry(stage).and_modify(|n| *n += 1).or_insert(1);

        let worker = self.clone();
        let handle = Handle::current();
        let thread = thread::Builder::new()
            .name(format!("stage-{stage}"))
            .spawn(move || worker.kernel_thread(stage, output, handle));
        match thread {
            Ok(thread) => {
                self.state.lock().threads.push(thread);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                if let Some(count) = state.running.get_mut(&stage) {
                    *count -= 1;
                    if *count == 0 {
                        state.running.remove(&stage);
                    }
                }
                Err(WorkerError::Bind(e.to_string()))
            }
        }
    }

    /// Body of one kernel thread.
    fn kernel_thread(self: Arc<Self>, stage: Stage, output: OutputBuffer, handle: Handle) {
        info!("Kernel thread for stage {stage} active on {}", self.url());
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute_stage(stage, &output, &handle)
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report_failure(&handle, format!("stage {stage} failed: {e}")),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".to_string());
                self.report_failure(&handle, format!("kernel panicked on stage {stage}: {message}"));
            }
        }
    }

    fn execute_stage(
        &self,
        stage: Stage,
        output: &OutputBuffer,
        handle: &Handle,
    ) -> Result<(), WorkerError> {
        let (gatherer, coordinator, role) = {
            let state = self.state.lock();
            (
                state.gatherer.clone().ok_or(WorkerError::NotInitialized)?,
                state
                    .coordinator
                    .clone()
                    .ok_or(WorkerError::NotInitialized)?,
                self.stage_role(&state, stage),
            )
        };

        for (key, mut values) in gatherer.items(stage)? {
            match &role {
                StageRole::Feeder => {
                    // The single feeder record holds the pickled items;
                    // unfold it into (index, item) pairs.
                    for blob in values.by_ref() {
                        let items: Vec<Vec<u8>> =
                            bincode::deserialize(&blob).map_err(WorkerError::MalformedPayload)?;
                        for (index, item) in items.into_iter().enumerate() {
                            output.queue(encode(&(index as u64)), Bytes::from(item))?;
                        }
                    }
                }
                StageRole::User { kernel, strip, funnel } => {
                    let kernel_key = if *strip { Bytes::new() } else { key };
                    let mut failure = None;
                    kernel.invoke(kernel_key, &mut values, &mut |k, v| {
                        if failure.is_some() {
                            return;
                        }
                        // The last user stage funnels: everything is
                        // re-keyed to the constant 0 and the original
                        // pair rides in the value.
                        let result = if *funnel {
                            output.queue(feeder_key(), encode(&(k.as_ref(), v.as_ref())))
                        } else {
                            output.queue(k, v)
                        };
                        if let Err(e) = result {
                            failure = Some(e);
                        }
                    });
                    if let Some(e) = failure {
                        return Err(e.into());
                    }
                }
                StageRole::Collector => {
                    self.serve_results(values.by_ref(), handle, &coordinator)?;
                }
            }
        }

        gatherer.discard(stage);

        handle
            .block_on(coordinator.stage_thread_ended(&self.url(), stage))
            .map_err(|e| WorkerError::Coordinator(e.to_string()))?;

        let last = {
            let mut state = self.state.lock();
            let count = state.running.entry(stage).or_insert(1);
            *count -= 1;
            let last = *count == 0;
            if last {
                state.running.remove(&stage);
            }
            last
        };
        if last {
            output.queue_eof()?;
        }
        info!("Kernel thread for stage {stage} done on {}", self.url());
        Ok(())
    }

    fn stage_role(&self, state: &WorkerState, stage: Stage) -> StageRole {
        let nkernels = state.kernels.len() as Stage;
        if stage == -1 {
            StageRole::Feeder
        } else if stage == nkernels {
            StageRole::Collector
        } else {
            StageRole::User {
                kernel: state.kernels[stage as usize].clone(),
                strip: stage == 0,
                funnel: stage == nkernels - 1,
            }
        }
    }

    /// Open a short-lived HTTP port, tell the coordinator where it is,
    /// and stream the result values to the client when it connects.
    /// Returns once the stream has been fully delivered.
    fn serve_results(
        &self,
        values: &mut dyn Iterator<Item = Bytes>,
        handle: &Handle,
        coordinator: &CoordinatorClient,
    ) -> Result<(), WorkerError> {
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let (tx_served, rx_served) = oneshot::channel::<()>();

        let slot: ResultSlot = Arc::new(Mutex::new(Some((rx, tx_served))));
        let app = Router::new()
            .route("/", get(serve_result_stream))
            .layer(Extension(slot));

        let (mut server, url) = handle.block_on(async {
            let address = tokio::net::lookup_host((self.hostname.as_str(), 0))
                .await
                .map_err(|e| WorkerError::Bind(e.to_string()))?
                .next()
                .ok_or_else(|| WorkerError::Bind("cannot resolve result host".to_string()))?;
            let server = spawn_server(address, app).map_err(|e| WorkerError::Bind(e.to_string()))?;
            let url = format!("http://{}:{}/", self.hostname, server.addr.port());
            Ok::<_, WorkerError>((server, url))
        })?;

        info!("Serving results on {url}");
        handle
            .block_on(coordinator.notify_client_of_result(&url))
            .map_err(|e| WorkerError::Coordinator(e.to_string()))?;

        for value in values {
            if tx.blocking_send(value).is_err() {
                warn!("Result stream consumer went away");
                break;
            }
        }
        drop(tx);

        // Wait until the body has been streamed (or the client vanished).
        let _ = handle.block_on(rx_served);
        server.shutdown();
        info!("Results served");
        Ok(())
    }

    fn report_failure(&self, handle: &Handle, message: String) {
        error!("{message}");
        let coordinator = self.state.lock().coordinator.clone();
        if let Some(coordinator) = coordinator {
            let url = self.url();
            let _ = handle.block_on(coordinator.report_failure(&url, &message));
        }
    }

    /// Coordinator-driven teardown: stop the scatterer and gatherer,
    /// join kernel threads with a bounded timeout, then let the process
    /// exit.
    async fn shutdown(&self) {
        info!("Shutting down worker {}", self.url());
        let (scatterer, gatherer, threads) = {
            let mut state = self.state.lock();
            (
                state.scatterer.take(),
                state.gatherer.take(),
                std::mem::take(&mut state.threads),
            )
        };
        if let Some(scatterer) = scatterer {
            scatterer.shutdown().await;
        }
        if let Some(gatherer) = gatherer {
            gatherer.shutdown();
        }
        let grace = Duration::from_millis(self.parameters.shutdown_grace_ms);
        let join = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let name = thread.thread().name().unwrap_or("kernel").to_string();
                if thread.join().is_err() {
                    warn!("Kernel thread {name} panicked before shutdown");
                }
            }
        });
        if tokio::time::timeout(grace, join).await.is_err() {
            error!("Kernel threads still alive after {grace:?}; exiting anyway");
        }
        self.exit.notify_one();
    }

    fn stat(&self) -> WorkerStat {
        let state = self.state.lock();
        WorkerStat {
            url: self.url(),
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            running: state.running.iter().map(|(s, n)| (*s, *n)).collect(),
        }
    }
}

enum StageRole {
    Feeder,
    User {
        kernel: Arc<dyn Kernel>,
        strip: bool,
        funnel: bool,
    },
    Collector,
}

type ResultSlot = Arc<Mutex<Option<(mpsc::Receiver<Bytes>, oneshot::Sender<()>)>>>;

/// Fires its sender when dropped, i.e. when the response stream has been
/// fully written out (or abandoned).
struct CompletionGuard(Option<oneshot::Sender<()>>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_result_stream(Extension(slot): Extension<ResultSlot>) -> impl IntoResponse {
    let taken = slot.lock().take();
    match taken {
        Some((rx, tx_served)) => {
            let guard = CompletionGuard(Some(tx_served));
            let stream = ReceiverStream::new(rx).map(move |value| {
                let _hold = &guard;
                Ok::<_, std::convert::Infallible>(prefix_frame(&value))
            });
            StreamBody::new(stream).into_response()
        }
        // The results are delivered exactly once.
        None => StatusCode::GONE.into_response(),
    }
}

#[async_trait]
impl RpcService for Worker {
    type Request = WorkerRequest;
    type Response = WorkerResponse;

    async fn handle(self: Arc<Self>, request: WorkerRequest) -> WorkerResponse {
        let result = match request {
            WorkerRequest::Initialize {
                coordinator_url,
                payload,
            } => self
                .initialize(coordinator_url, payload)
                .await
                .map(|_| WorkerResponse::Ack),
            WorkerRequest::RunStage { stage, maxpeers } => self
                .run_stage(stage, maxpeers)
                .await
                .map(|_| WorkerResponse::Ack),
            WorkerRequest::StageEnded { stage } => {
                let gatherer = self.state.lock().gatherer.clone();
                match gatherer {
                    Some(gatherer) => gatherer
                        .stage_ended(stage)
                        .map(|_| WorkerResponse::Ack)
                        .map_err(WorkerError::from),
                    None => Err(WorkerError::NotInitialized),
                }
            }
            WorkerRequest::GathererAddr => {
                let gatherer = self.state.lock().gatherer.clone();
                match gatherer {
                    Some(gatherer) => {
                        let (host, port) = gatherer.addr();
                        Ok(WorkerResponse::GathererAddr { host, port })
                    }
                    None => Err(WorkerError::NotInitialized),
                }
            }
            WorkerRequest::Shutdown => {
                self.shutdown().await;
                Ok(WorkerResponse::Ack)
            }
            WorkerRequest::Stat => Ok(WorkerResponse::Stat(self.stat())),
        };
        result.unwrap_or_else(|e| WorkerResponse::Error(e.to_string()))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("Failed to bind: {0}")]
    Bind(String),
    #[error("Worker is not initialized")]
    NotInitialized,
    #[error("Stage {0} is out of range")]
    BadStage(Stage),
    #[error("Malformed job payload: {0}")]
    MalformedPayload(#[source] bincode::Error),
    #[error(transparent)]
    Kernel(#[from] kernel::KernelError),
    #[error(transparent)]
    Buffer(#[from] crate::buffer::BufferError),
    #[error("Coordinator call failed: {0}")]
    Coordinator(String),
}
