// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use serde::Deserialize;

struct EchoService;

#[derive(Debug, serde::Serialize, Deserialize)]
enum EchoRequest {
    Say(String),
    Fail,
}

#[derive(Debug, serde::Serialize, Deserialize)]
enum EchoResponse {
    Said(String),
    Error(String),
}

#[async_trait]
impl RpcService for EchoService {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle(self: Arc<Self>, request: EchoRequest) -> EchoResponse {
        match request {
            EchoRequest::Say(text) => EchoResponse::Said(text),
            EchoRequest::Fail => EchoResponse::Error("nope".to_string()),
        }
    }
}

#[tokio::test]
async fn round_trip() {
    let addr = "127.0.0.1:0".parse().unwrap();
    let mut server = spawn_server(addr, rpc_router(Arc::new(EchoService))).unwrap();

    let client = RpcClient::new(format!("http://{}", server.addr));
    let response: EchoResponse = client
        .call(&EchoRequest::Say("ping".to_string()))
        .await
        .unwrap();
    assert!(matches!(response, EchoResponse::Said(text) if text == "ping"));

    server.shutdown();
}

#[tokio::test]
async fn error_variant_travels() {
    let addr = "127.0.0.1:0".parse().unwrap();
    let mut server = spawn_server(addr, rpc_router(Arc::new(EchoService))).unwrap();

    let client = RpcClient::new(format!("http://{}", server.addr));
    let response: EchoResponse = client.call(&EchoRequest::Fail).await.unwrap();
    assert!(matches!(response, EchoResponse::Error(e) if e == "nope"));

    server.shutdown();
}

#[tokio::test]
async fn unreachable_server_is_reported() {
    // Bind then immediately release a port so nothing listens on it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let client = RpcClient::new(format!("http://{addr}"));
    let result: Result<EchoResponse, _> = client.call(&EchoRequest::Say("x".to_string())).await;
    assert!(matches!(result, Err(RpcError::Unreachable { .. })));
}
