// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;

fn spec_with_cwd(cwd: &std::path::Path) -> Bytes {
    let spec = TaskSpec {
        program: "/bin/true".into(),
        cwd: cwd.to_path_buf(),
        args: vec![],
        env: vec![],
        nitems: 0,
        nkernels: 0,
        nlocals: 0,
    };
    Bytes::from(spec.to_bytes())
}

#[tokio::test]
async fn peer_registers_in_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (peer, mut server) = Peer::spawn(
        "127.0.0.1",
        0,
        dir.path().to_path_buf(),
        Parameters::default(),
        None,
    )
    .await
    .unwrap();

    let peers = directory::list(dir.path()).unwrap();
    assert_eq!(peers, vec![peer.url()]);

    peer.cleanup();
    assert!(directory::list(dir.path()).unwrap().is_empty());
    server.shutdown();
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (peer, mut server) = Peer::spawn(
        "127.0.0.1",
        0,
        dir.path().to_path_buf(),
        Parameters::default(),
        None,
    )
    .await
    .unwrap();

    // A working directory that does not exist fails the spawn itself.
    let nowhere = dir.path().join("missing");
    let result = peer
        .start_worker("task-1".to_string(), spec_with_cwd(&nowhere))
        .await;
    assert!(matches!(result, Err(PeerError::SpawnFailed(_))), "{result:?}");
    assert_eq!(peer.stat().n_workers, 0);

    peer.cleanup();
    server.shutdown();
}

#[tokio::test]
async fn garbage_task_specs_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (peer, mut server) = Peer::spawn(
        "127.0.0.1",
        0,
        dir.path().to_path_buf(),
        Parameters::default(),
        None,
    )
    .await
    .unwrap();

    let result = peer
        .start_worker("task-2".to_string(), Bytes::from_static(b"\xff\xff"))
        .await;
    assert!(matches!(result, Err(PeerError::BadSpec(_))));

    peer.cleanup();
    server.shutdown();
}
