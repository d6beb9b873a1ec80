// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{error::Error, net::SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::{JoinHandle, JoinSet},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::codec::wire_codec;

/// Write half of an accepted connection, handed to the handler so it can
/// reply on the same socket.
pub type Writer = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;

/// Called for every frame received on an accepted connection. Returning
/// an error closes that connection; other connections are unaffected.
#[async_trait]
pub trait MessageHandler: Clone + Send + Sync + 'static {
    async fn dispatch(&self, writer: &mut Writer, message: Bytes) -> Result<(), Box<dyn Error>>;
}

/// A TCP server accepting framed connections and feeding every received
/// frame to a `MessageHandler`. One task per connection; the accept loop
/// and all connection tasks stop when the handle is dropped or
/// `shutdown` is called.
pub struct Receiver {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Receiver {
    /// Bind `address` (port 0 picks an ephemeral port) and start
    /// accepting connections.
    pub async fn spawn<H: MessageHandler>(
        address: SocketAddr,
        handler: H,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&address).await?;
        let addr = listener.local_addr()?;
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let handle = tokio::spawn(Self::run(listener, handler, rx_shutdown));
        Ok(Self {
            addr,
            shutdown: Some(tx_shutdown),
            handle,
        })
    }

    async fn run<H: MessageHandler>(
        listener: TcpListener,
        handler: H,
        mut rx_shutdown: oneshot::Receiver<()>,
    ) {
        // Dropping the set aborts every connection task with it.
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    debug!("Incoming connection established with {peer}");
                    connections.spawn(Self::handle_connection(socket, handler.clone(), peer));
                }
                _ = &mut rx_shutdown => break,
            }
        }
    }

    async fn handle_connection<H: MessageHandler>(socket: TcpStream, handler: H, peer: SocketAddr) {
        let transport = Framed::new(socket, wire_codec());
        let (mut writer, mut reader) = transport.split();
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(message) => {
                    if let Err(e) = handler.dispatch(&mut writer, message.freeze()).await {
                        warn!("{e}");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read frame from {peer}: {e}");
                    break;
                }
            }
        }
        debug!("Connection with {peer} closed");
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/receiver_tests.rs"]
mod receiver_tests;
