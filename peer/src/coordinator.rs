// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The coordinator: one per submitted job. Owns the worker roster, the
//! lazy key-to-worker routing tables and the stage barriers, and feeds
//! progress back to the submitting client.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use config::Parameters;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};
use types::{
    CoordinatorRequest, CoordinatorResponse, CoordinatorStat, KeyHash, Progress, Stage, TaskSpec,
};

use network::{PeerClient, RpcService, ServerHandle, WorkerClient};

/// Remote worker bookkeeping: the real state lives in the worker
/// process, this proxy carries its url and cached counters.
pub(crate) struct WorkerProxy {
    pub url: String,
    pub peer_url: String,
    pub client: WorkerClient,
    /// stage -> kernel threads we expect to be running there.
    pub running: HashMap<Stage, usize>,
    /// stage -> keys assigned there.
    pub nkeys: HashMap<Stage, u64>,
    pub nkeys_total: u64,
}

impl WorkerProxy {
    pub fn new(url: String, peer_url: String) -> Self {
        Self {
            client: WorkerClient::new(&url),
            url,
            peer_url,
            running: HashMap::new(),
            nkeys: HashMap::new(),
            nkeys_total: 0,
        }
    }
}

pub(crate) struct Inner {
    pub workers: HashMap<String, WorkerProxy>,
    /// Min-heap of (nkeys, worker url). Entries are lazily invalidated:
    /// a popped entry whose count no longer matches the proxy is stale
    /// and skipped.
    pub heap: BinaryHeap<Reverse<(u64, String)>>,
    pub destinations: HashMap<Stage, HashMap<KeyHash, String>>,
    pub maxpeers: HashMap<Stage, u32>,
    pub all_peers: Vec<String>,
    pub free_peers: Vec<String>,
    pub last_refresh: Option<Instant>,
    pub done: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            heap: BinaryHeap::new(),
            destinations: HashMap::new(),
            maxpeers: HashMap::new(),
            all_peers: Vec::new(),
            free_peers: Vec::new(),
            last_refresh: None,
            done: false,
        }
    }

    /// Pop the least-loaded live worker. The caller must push a fresh
    /// entry after it changes the worker's key count.
    pub fn pop_least_loaded(&mut self) -> Option<String> {
        while let Some(Reverse((nkeys, url))) = self.heap.pop() {
            match self.workers.get(&url) {
                Some(proxy) if proxy.nkeys_total == nkeys => return Some(url),
                // Stale entry; a fresher one is further down.
                _ => continue,
            }
        }
        None
    }

    pub fn push_load(&mut self, url: &str) {
        if let Some(proxy) = self.workers.get(url) {
            self.heap.push(Reverse((proxy.nkeys_total, url.to_string())));
        }
    }
}

pub struct Coordinator {
    task_id: String,
    spec: TaskSpec,
    data: Bytes,
    hostname: String,
    peer: PeerClient,
    parameters: Parameters,
    start_time: Instant,
    url: Mutex<String>,
    server: Mutex<Option<ServerHandle>>,
    progress: Mutex<Option<mpsc::UnboundedSender<Progress>>>,
    finished: Mutex<Option<oneshot::Sender<()>>>,
    inner: tokio::sync::Mutex<Inner>,
}

impl Coordinator {
    /// Returns the coordinator, the progress stream for the client, and
    /// a signal that fires once the job reaches a terminal state.
    pub fn new(
        task_id: String,
        spec: TaskSpec,
        data: Bytes,
        peer_url: &str,
        hostname: String,
        parameters: Parameters,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Progress>,
        oneshot::Receiver<()>,
    ) {
        let (tx_progress, rx_progress) = mpsc::unbounded_channel();
        let (tx_finished, rx_finished) = oneshot::channel();
        let coordinator = Arc::new(Self {
            task_id,
            spec,
            data,
            hostname,
            peer: PeerClient::new(peer_url),
            parameters,
            start_time: Instant::now(),
            url: Mutex::new(String::new()),
            server: Mutex::new(None),
            progress: Mutex::new(Some(tx_progress)),
            finished: Mutex::new(Some(tx_finished)),
            inner: tokio::sync::Mutex::new(Inner::new()),
        });
        (coordinator, rx_progress, rx_finished)
    }

    /// Attach the RPC server this coordinator is reachable on.
    pub fn set_server(&self, server: ServerHandle) {
        *self.url.lock() = format!("http://{}:{}", self.hostname, server.addr.port());
        *self.server.lock() = Some(server);
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn progress(&self, message: Progress) {
        debug!("Progress for task {}: {message:?}", self.task_id);
        if let Some(tx) = self.progress.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Send the terminal message and release everything the client or
    /// the peer may be waiting on.
    fn finish(&self, terminal: Progress) {
        self.progress(terminal);
        self.progress.lock().take();
        if let Some(tx) = self.finished.lock().take() {
            let _ = tx.send(());
        }
        if let Some(mut server) = self.server.lock().take() {
            server.shutdown();
        }
    }

    /// Abort the job: one terminal message, best-effort worker teardown.
    pub(crate) async fn fail(&self, reason: String) {
        let clients: Vec<WorkerClient> = {
            let mut inner = self.inner.lock().await;
            if inner.done {
                return;
            }
            inner.done = true;
            inner.workers.values().map(|w| w.client.clone()).collect()
        };
        error!("Task {} failed: {reason}", self.task_id);
        self.finish(Progress::Failed { reason });
        for client in clients {
            if let Err(e) = client.shutdown().await {
                warn!("Best-effort shutdown of {} failed: {e}", client.url());
            }
        }
    }

    /// Kick the job off: pre-spawn one worker per known peer, then run
    /// the feeder stage on the least-loaded one.
    pub async fn start(self: Arc<Self>) {
        self.progress(Progress::Start);
        if let Err(reason) = self.clone().try_start().await {
            self.fail(reason).await;
        }
    }

    async fn try_start(self: Arc<Self>) -> Result<(), String> {
        let peers = {
            let mut inner = self.inner.lock().await;
            self.refresh_peers(&mut inner, true).await?;
            inner.all_peers.clone()
        };
        if peers.is_empty() {
            return Err("no peers available in the directory".to_string());
        }
        info!(
            "Starting task {} across {} peers",
            self.task_id,
            peers.len()
        );

        let mut spawns = JoinSet::new();
        for peer_url in peers {
            let this = self.clone();
            spawns.spawn(async move { this.start_remote_worker(&peer_url).await });
        }
        while let Some(joined) = spawns.join_next().await {
            joined.map_err(|e| e.to_string())??;
        }

        // One synthetic key primes the feeder.
        let mut inner = self.inner.lock().await;
        let maxpeers = self.maxpeers(&mut inner, 0).await?;
        let url = inner
            .pop_least_loaded()
            .ok_or_else(|| "no live workers".to_string())?;
        let proxy = inner.workers.get_mut(&url).expect("popped workers exist");
        proxy
            .client
            .run_stage(-1, maxpeers)
            .await
            .map_err(|e| e.to_string())?;
        proxy.running.insert(-1, 1);
        *proxy.nkeys.entry(-1).or_insert(0) += 1;
        proxy.nkeys_total += 1;
        inner.push_load(&url);
        Ok(())
    }

    /// Start and initialize a worker on `peer_url`. Used concurrently at
    /// start; bookkeeping happens under the roster lock, the RPCs do not.
    async fn start_remote_worker(&self, peer_url: &str) -> Result<String, String> {
        let peer = if peer_url == self.peer.url() {
            self.peer.clone()
        } else {
            PeerClient::new(peer_url)
        };
        debug!("Launching a worker for task {} on {peer_url}", self.task_id);
        let worker_url = peer
            .start_worker(&self.task_id, Bytes::from(self.spec.to_bytes()))
            .await
            .map_err(|e| e.to_string())?;
        {
            let mut inner = self.inner.lock().await;
            self.adopt_worker(&mut inner, &worker_url, peer_url);
        }
        WorkerClient::new(&worker_url)
            .initialize(&self.url(), self.data.clone())
            .await
            .map_err(|e| e.to_string())?;
        self.progress(Progress::WorkerStart {
            peer_url: peer_url.to_string(),
            worker_url: worker_url.clone(),
        });
        Ok(worker_url)
    }

    /// Same as `start_remote_worker` but with the roster lock already
    /// held (the `get_destinations` path).
    async fn start_remote_worker_locked(
        &self,
        inner: &mut Inner,
        peer_url: &str,
    ) -> Result<String, String> {
        let worker_url = PeerClient::new(peer_url)
            .start_worker(&self.task_id, Bytes::from(self.spec.to_bytes()))
            .await
            .map_err(|e| e.to_string())?;
        self.adopt_worker(inner, &worker_url, peer_url);
        WorkerClient::new(&worker_url)
            .initialize(&self.url(), self.data.clone())
            .await
            .map_err(|e| e.to_string())?;
        self.progress(Progress::WorkerStart {
            peer_url: peer_url.to_string(),
            worker_url: worker_url.clone(),
        });
        Ok(worker_url)
    }

    fn adopt_worker(&self, inner: &mut Inner, worker_url: &str, peer_url: &str) {
        inner.free_peers.retain(|p| p != peer_url);
        inner.workers.insert(
            worker_url.to_string(),
            WorkerProxy::new(worker_url.to_string(), peer_url.to_string()),
        );
        inner.heap.push(Reverse((0, worker_url.to_string())));
    }

    async fn refresh_peers(&self, inner: &mut Inner, force: bool) -> Result<(), String> {
        let fresh_for = Duration::from_millis(self.parameters.peer_refresh_ms);
        if !force && matches!(inner.last_refresh, Some(at) if at.elapsed() < fresh_for) {
            return Ok(());
        }
        let all = self.peer.list_peers().await.map_err(|e| e.to_string())?;
        let used: Vec<&String> = inner.workers.values().map(|w| &w.peer_url).collect();
        inner.free_peers = all
            .iter()
            .filter(|p| !used.contains(p))
            .cloned()
            .collect();
        inner.all_peers = all;
        inner.last_refresh = Some(Instant::now());
        debug!(
            "Refreshed the peer roster ({} all, {} unused)",
            inner.all_peers.len(),
            inner.free_peers.len()
        );
        Ok(())
    }

    /// The routing modulus of a stage, fixed at first use. The collector
    /// stage always funnels into a single worker.
    async fn maxpeers(&self, inner: &mut Inner, stage: Stage) -> Result<u32, String> {
        if stage == self.spec.nkernels as Stage {
            return Ok(1);
        }
        if let Some(value) = inner.maxpeers.get(&stage) {
            return Ok(*value);
        }
        self.refresh_peers(inner, false).await?;
        let value = inner.all_peers.len().max(1) as u32;
        inner.maxpeers.insert(stage, value);
        Ok(value)
    }

    /// Resolve `(stage, keyhash)` to a worker, placing it first on an
    /// unused peer and otherwise on the least-loaded worker. Returns the
    /// full mapping for the stage so the caller can cache it.
    async fn get_destinations(
        &self,
        stage: Stage,
        keyhash: KeyHash,
    ) -> Result<Vec<(KeyHash, String)>, String> {
        let mut inner = self.inner.lock().await;
        if inner.done {
            return Err("task already finished".to_string());
        }
        let unmapped = !inner
            .destinations
            .get(&stage)
            .map_or(false, |map| map.contains_key(&keyhash));
        if unmapped {
            if let Err(e) = self.refresh_peers(&mut inner, false).await {
                warn!("Peer roster refresh failed: {e}");
            }
            let chosen_peer = inner.free_peers.choose(&mut rand::thread_rng()).cloned();
            let url = match chosen_peer {
                Some(peer_url) => self.start_remote_worker_locked(&mut inner, &peer_url).await?,
                None => inner
                    .pop_least_loaded()
                    .ok_or_else(|| "no live workers".to_string())?,
            };
            let maxpeers = self.maxpeers(&mut inner, stage).await?;
            let proxy = inner.workers.get_mut(&url).expect("chosen workers exist");
            if !proxy.running.contains_key(&stage) {
                proxy
                    .client
                    .run_stage(stage, maxpeers)
                    .await
                    .map_err(|e| e.to_string())?;
                proxy.running.insert(stage, 1);
            }
            *proxy.nkeys.entry(stage).or_insert(0) += 1;
            proxy.nkeys_total += 1;
            let nkeys = proxy.nkeys_total;
            inner
                .destinations
                .entry(stage)
                .or_default()
                .insert(keyhash, url.clone());
            inner.push_load(&url);
            info!("Assigned stage {stage} keyhash {keyhash} to {url} (nkeys {nkeys})");
        }
        Ok(inner
            .destinations
            .get(&stage)
            .map(|map| map.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default())
    }

    /// Bookkeeping only; must never call the worker back.
    async fn stage_thread_ended(&self, worker_url: &str, stage: Stage) {
        let remaining = {
            let mut inner = self.inner.lock().await;
            match inner
                .workers
                .get_mut(worker_url)
                .and_then(|proxy| proxy.running.get_mut(&stage))
            {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => return,
            }
        };
        self.progress(Progress::ThreadEndedOnWorker {
            worker_url: worker_url.to_string(),
            stage,
            remaining,
        });
    }

    /// A worker finished a stage (threads exited, downstream acked).
    /// Heavy processing runs on a spawned task, never inline: the worker
    /// blocks on this RPC from inside its scatterer loop.
    fn stage_ended(self: &Arc<Self>, worker_url: String, stage: Stage) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(reason) = this.process_stage_ended(&worker_url, stage).await {
                this.fail(reason).await;
            }
        });
    }

    async fn process_stage_ended(&self, worker_url: &str, stage: Stage) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if inner.done {
            return Ok(());
        }
        let proxy = match inner.workers.get_mut(worker_url) {
            Some(proxy) => proxy,
            None => return Ok(()),
        };
        debug!("Worker {worker_url} reports stage {stage} ended");
        let freed = proxy.nkeys.remove(&stage).unwrap_or(0);
        proxy.nkeys_total = proxy.nkeys_total.saturating_sub(freed);
        proxy.running.remove(&stage);
        let url = proxy.url.clone();
        inner.push_load(&url);
        self.progress(Progress::StageEndedOnWorker {
            worker_url: worker_url.to_string(),
            stage,
        });

        if inner
            .workers
            .values()
            .any(|proxy| proxy.running.contains_key(&stage))
        {
            return Ok(());
        }
        self.complete_stage(&mut inner, stage).await
    }

    /// The stage ended on every worker. Tell the workers running the
    /// next stage that their input is complete, free the routing state,
    /// and finish the job once the collector stage itself ends. A stage
    /// nobody runs (its producer emitted nothing) completes in the same
    /// sweep, so an empty pipeline still terminates.
    async fn complete_stage(&self, inner: &mut Inner, mut stage: Stage) -> Result<(), String> {
        loop {
            info!("Stage {stage} ended globally for task {}", self.task_id);
            self.progress(Progress::StageEnded { stage });

            let next: Vec<WorkerClient> = inner
                .workers
                .values()
                .filter(|proxy| proxy.running.contains_key(&(stage + 1)))
                .map(|proxy| proxy.client.clone())
                .collect();
            for client in &next {
                client.stage_ended(stage).await.map_err(|e| e.to_string())?;
            }
            inner.destinations.remove(&stage);
            inner.maxpeers.remove(&stage);

            if stage == self.spec.nkernels as Stage {
                inner.done = true;
                let clients: Vec<WorkerClient> =
                    inner.workers.values().map(|w| w.client.clone()).collect();
                info!("Task {} is complete", self.task_id);
                self.finish(Progress::Done);
                for client in clients {
                    if let Err(e) = client.shutdown().await {
                        warn!("Shutdown of {} failed: {e}", client.url());
                    }
                }
                return Ok(());
            }
            if !next.is_empty() {
                return Ok(());
            }
            stage += 1;
        }
    }

    fn stat(&self) -> CoordinatorStat {
        CoordinatorStat {
            task_id: self.task_id.clone(),
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            n_workers: 0,
        }
    }
}

#[async_trait]
impl RpcService for Coordinator {
    type Request = CoordinatorRequest;
    type Response = CoordinatorResponse;

    async fn handle(self: Arc<Self>, request: CoordinatorRequest) -> CoordinatorResponse {
        match request {
            CoordinatorRequest::GetDestinations { stage, keyhash } => {
                match self.get_destinations(stage, keyhash).await {
                    Ok(map) => CoordinatorResponse::Destinations(map),
                    Err(reason) => {
                        self.fail(reason.clone()).await;
                        CoordinatorResponse::Error(reason)
                    }
                }
            }
            CoordinatorRequest::StageThreadEnded { worker_url, stage } => {
                self.stage_thread_ended(&worker_url, stage).await;
                CoordinatorResponse::Ack
            }
            CoordinatorRequest::StageEnded { worker_url, stage } => {
                self.stage_ended(worker_url, stage);
                CoordinatorResponse::Ack
            }
            CoordinatorRequest::NotifyClientOfResult { url } => {
                self.progress(Progress::Result { url });
                CoordinatorResponse::Ack
            }
            CoordinatorRequest::ReportFailure {
                worker_url,
                message,
            } => {
                self.fail(format!("{worker_url}: {message}")).await;
                CoordinatorResponse::Ack
            }
            CoordinatorRequest::Stat => {
                let mut stat = self.stat();
                stat.n_workers = self.inner.lock().await.workers.len();
                CoordinatorResponse::Stat(stat)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod coordinator_tests;
