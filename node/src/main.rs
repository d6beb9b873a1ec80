// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The node binary. Without flags it runs as a peer daemon; with
//! `--worker=<hostname>` it runs as a worker for one job, announcing its
//! RPC url as the first line on stdout.

use std::{
    io::Write,
    path::PathBuf,
    process::exit,
};

use clap::Parser;
use config::{Import, Parameters};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "node", about = "Peer-to-peer map-reduce node")]
struct Args {
    /// Run as a worker bound to the given hostname instead of a peer.
    #[clap(long, value_name = "HOSTNAME")]
    worker: Option<String>,

    /// Shared directory where peers advertise themselves.
    #[clap(long, default_value = "peers")]
    directory: PathBuf,

    /// Hostname to bind the peer server on.
    #[clap(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Port of the peer server (0 picks an ephemeral port).
    #[clap(long, default_value_t = 0)]
    port: u16,

    /// Optional json file overriding the default parameters.
    #[clap(long, value_name = "FILE")]
    parameters: Option<PathBuf>,

    /// Client program path and argv, recorded in task specs.
    #[clap(value_name = "PROGRAM")]
    program: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr: in worker mode stdout carries exactly one line,
    // the worker's url, read by the spawning peer.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Started {args:?}");

    let parameters = match &args.parameters {
        Some(path) => match Parameters::import(path) {
            Ok(parameters) => parameters,
            Err(e) => {
                error!("{e}");
                exit(1);
            }
        },
        None => Parameters::default(),
    };
    parameters.tracing();

    match args.worker.clone() {
        Some(hostname) => run_worker(&hostname, parameters).await,
        None => run_peer(args, parameters).await,
    }
}

async fn run_worker(hostname: &str, parameters: Parameters) {
    let (worker, mut server) = match worker::Worker::spawn(hostname, parameters).await {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Failed to start the worker: {e}");
            exit(1);
        }
    };

    // The contract with the spawning peer: the url is the first line.
    println!("{}", worker.url());
    let _ = std::io::stdout().flush();

    worker.exit_signal().notified().await;
    server.shutdown();
    server.wait().await;
    info!("Worker exiting");
}

async fn run_peer(args: Args, parameters: Parameters) {
    let (peer, mut server) = match peer::Peer::spawn(
        &args.hostname,
        args.port,
        args.directory.clone(),
        parameters,
        args.parameters.clone(),
    )
    .await
    {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Failed to start the peer: {e}");
            exit(1);
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("Peer shutting down");
    peer.cleanup();
    server.shutdown();
    server.wait().await;
}
