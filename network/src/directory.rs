// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The peer directory: a shared filesystem path holding one file per
//! live peer (`<hostname>:<port>.peer`, content is the peer's RPC url).
//! Registration is best-effort; readers must treat unreachable entries
//! as gone.

use std::{
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
};

use tracing::debug;

pub const PEER_SUFFIX: &str = "peer";

/// Advertise a peer. Returns the entry path for later removal.
pub fn register(directory: &Path, hostname: &str, port: u16, url: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(directory)?;
    let entry = directory.join(format!("{hostname}:{port}.{PEER_SUFFIX}"));
    fs::write(&entry, format!("{url}\n"))?;
    debug!("Registered {} as {}", url, entry.display());
    Ok(entry)
}

/// Remove a previously registered entry. Missing entries are fine.
pub fn unregister(entry: &Path) {
    match fs::remove_file(entry) {
        Ok(()) => debug!("Unregistered {}", entry.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Failed to unregister {}: {e}", entry.display()),
    }
}

/// Urls of all advertised peers, in directory order.
pub fn list(directory: &Path) -> io::Result<Vec<String>> {
    let mut peers = Vec::new();
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(peers),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PEER_SUFFIX) {
            continue;
        }
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            // A peer may unregister while we scan.
            Err(_) => continue,
        };
        let mut url = String::new();
        if io::BufReader::new(file).read_line(&mut url).is_ok() {
            let url = url.trim();
            if !url.is_empty() {
                peers.push(url.to_string());
            }
        }
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_list_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let entry = register(dir.path(), "host-a", 7001, "http://host-a:7001").unwrap();
        register(dir.path(), "host-b", 7002, "http://host-b:7002").unwrap();
        // Non-peer files are ignored.
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut peers = list(dir.path()).unwrap();
        peers.sort();
        assert_eq!(peers, vec!["http://host-a:7001", "http://host-b:7002"]);

        unregister(&entry);
        assert_eq!(list(dir.path()).unwrap(), vec!["http://host-b:7002"]);
        // Unregistering twice is harmless.
        unregister(&entry);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let nowhere = dir.path().join("nothing");
        assert!(list(&nowhere).unwrap().is_empty());
    }
}
