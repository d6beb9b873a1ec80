// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The submission client: pick a live peer from the directory, post a
//! job, surface its progress stream, and collect the result values.

use std::{
    env,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use futures::StreamExt;
use kernel::KernelSpec;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info};
use types::{Progress, TaskSpec};

use network::{directory, FrameReader};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No active peers found in '{0}'")]
    NoPeers(PathBuf),
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Directory error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed stream: {0}")]
    Decode(#[from] bincode::Error),
    #[error("Peer rejected the submission: {0}")]
    Rejected(String),
    #[error("Job failed: {0}")]
    Job(String),
    #[error("Progress stream ended before DONE")]
    Truncated,
}

/// The submitting program's identity, captured explicitly rather than
/// through process-global state: workers re-create this environment.
#[derive(Clone, Debug)]
pub struct SubmissionContext {
    pub program: PathBuf,
    pub cwd: PathBuf,
    pub args: Vec<Vec<u8>>,
    pub env: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SubmissionContext {
    /// Capture the calling process's program, cwd, argv and environment.
    pub fn capture() -> std::io::Result<Self> {
        Ok(Self {
            program: env::current_exe()?,
            cwd: env::current_dir()?,
            args: env::args_os().map(|arg| os_bytes(&arg)).collect(),
            env: env::vars_os()
                .map(|(key, value)| (os_bytes(&key), os_bytes(&value)))
                .collect(),
        })
    }

    fn task_spec(&self, nitems: u64, nkernels: u32, nlocals: u32) -> TaskSpec {
        TaskSpec {
            program: self.program.clone(),
            cwd: self.cwd.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            nitems,
            nkernels,
            nlocals,
        }
    }
}

#[cfg(unix)]
fn os_bytes(value: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    value.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(value: &std::ffi::OsStr) -> Vec<u8> {
    value.to_string_lossy().into_owned().into_bytes()
}

/// Entry point for running map-reduce chains against a peer directory.
pub struct Pool {
    directory: PathBuf,
    http: reqwest::Client,
}

impl Pool {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Submit `items` through the kernel chain and collect the result
    /// values. Every progress record is handed to `on_progress` as it
    /// arrives; results are fetched when the collector announces them.
    pub async fn map_reduce_chain(
        &self,
        context: &SubmissionContext,
        items: Vec<Bytes>,
        kernels: Vec<KernelSpec>,
        locals: Vec<Bytes>,
        mut on_progress: impl FnMut(&Progress),
    ) -> Result<Vec<Bytes>, ClientError> {
        let spec = context.task_spec(items.len() as u64, kernels.len() as u32, locals.len() as u32);

        // The payload head carries the chain and the locals; the items
        // ride behind it as one self-delimiting blob.
        let mut data = bincode::serialize(&(&kernels, &locals))?;
        data.extend(bincode::serialize(&items)?);

        let peers = directory::list(&self.directory)?;
        let peer = peers
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| ClientError::NoPeers(self.directory.clone()))?;
        info!("Submitting {} items to {peer}", items.len());

        let response = self
            .http
            .post(format!("{peer}/execute"))
            .form(&[
                ("spec", base64::encode(spec.to_bytes())),
                ("data", base64::encode(&data)),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected(format!("{status}: {body}")));
        }

        let mut results = Vec::new();
        let mut reader = FrameReader::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            reader.extend(&chunk?);
            while let Some(frame) = reader.next_frame() {
                let message: Progress = bincode::deserialize(&frame)?;
                debug!("Progress: {message:?}");
                on_progress(&message);
                match message {
                    Progress::Result { url } => {
                        results.extend(self.fetch_results(&url).await?);
                    }
                    Progress::Done => return Ok(results),
                    Progress::Failed { reason } => return Err(ClientError::Job(reason)),
                    _ => {}
                }
            }
        }
        Err(ClientError::Truncated)
    }

    /// Drain the result stream the collector serves.
    async fn fetch_results(&self, url: &str) -> Result<Vec<Bytes>, ClientError> {
        debug!("Fetching results from {url}");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Rejected(format!(
                "result stream answered {}",
                response.status()
            )));
        }
        let mut values = Vec::new();
        let mut reader = FrameReader::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            reader.extend(&chunk?);
            while let Some(frame) = reader.next_frame() {
                values.push(frame);
            }
        }
        Ok(values)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_reflects_the_process() {
        let context = SubmissionContext::capture().unwrap();
        assert!(context.program.is_absolute());
        assert!(!context.args.is_empty());
        assert!(context
            .env
            .iter()
            .any(|(key, _)| key.as_slice() == &b"PATH"[..]));
    }

    #[tokio::test]
    async fn empty_directory_raises_no_peers() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(dir.path());
        let context = SubmissionContext::capture().unwrap();
        let result = pool
            .map_reduce_chain(&context, vec![], vec![], vec![], |_| {})
            .await;
        assert!(matches!(result, Err(ClientError::NoPeers(_))));
    }
}
