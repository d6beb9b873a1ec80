// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::Extension,
    http::StatusCode,
    routing::post,
    Router,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Failed to reach '{url}': {reason}")]
    Unreachable { url: String, reason: String },
    #[error("Failed to bind '{addr}': {reason}")]
    Bind { addr: String, reason: String },
    #[error("'{url}' answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One component's RPC surface: a request enum in, a response enum out.
/// Requests arrive as bincode HTTP bodies on `POST /rpc`.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    async fn handle(self: Arc<Self>, request: Self::Request) -> Self::Response;
}

async fn handle_rpc<S: RpcService>(
    Extension(service): Extension<Arc<S>>,
    body: Bytes,
) -> Result<Vec<u8>, StatusCode> {
    let request: S::Request = bincode::deserialize(&body).map_err(|e| {
        warn!("Rejecting malformed rpc request: {e}");
        StatusCode::BAD_REQUEST
    })?;
    let response = service.handle(request).await;
    bincode::serialize(&response).map_err(|e| {
        error!("Failed to serialize rpc response: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Build a router exposing `service` under `/rpc`. Components with
/// additional HTTP surfaces (the peer's `/execute`, the collector's
/// result stream) merge their routes into this one.
pub fn rpc_router<S: RpcService>(service: Arc<S>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc::<S>))
        .layer(Extension(service))
}

/// A running HTTP server. Dropping the handle does not stop the server;
/// call `shutdown` for a graceful stop.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    pub async fn wait(self) {
        self.handle.await.ok();
    }
}

/// Bind `addr` (port 0 picks an ephemeral port) and serve `app` until
/// shutdown.
pub fn spawn_server(addr: SocketAddr, app: Router) -> Result<ServerHandle, RpcError> {
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| RpcError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .serve(app.into_make_service());
    let addr = server.local_addr();
    let (tx_shutdown, rx_shutdown) = oneshot::channel::<()>();
    let graceful = server.with_graceful_shutdown(async move {
        rx_shutdown.await.ok();
    });
    let handle = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            error!("Server on {addr} failed: {e}");
        }
    });
    Ok(ServerHandle {
        addr,
        shutdown: Some(tx_shutdown),
        handle,
    })
}

/// Client side of the `/rpc` surface.
#[derive(Clone)]
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        request: &Req,
    ) -> Result<Resp, RpcError> {
        let body = bincode::serialize(request)
            .map_err(|e| RpcError::Protocol(format!("failed to encode request: {e}")))?;
        let response = self
            .http
            .post(format!("{}/rpc", self.url))
            .body(body)
            .send()
            .await
            .map_err(|e| RpcError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|e| RpcError::Unreachable {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        bincode::deserialize(&bytes)
            .map_err(|e| RpcError::Protocol(format!("failed to decode response: {e}")))
    }
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod rpc_tests;
