// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{fs::File, io::BufWriter, path::Path};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{file}': {message}")]
    ImportError { file: String, message: String },
    #[error("Failed to write config file '{file}': {message}")]
    ExportError { file: String, message: String },
}

pub trait Import: DeserializeOwned {
    fn import(path: &Path) -> Result<Self, ConfigError> {
        let reader = || -> Result<Self, std::io::Error> {
            let data = std::fs::read(path)?;
            Ok(serde_json::from_slice(data.as_slice())?)
        };
        reader().map_err(|e| ConfigError::ImportError {
            file: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl<D: DeserializeOwned> Import for D {}

pub trait Export: Serialize {
    fn export(&self, path: &Path) -> Result<(), ConfigError> {
        let writer = || -> Result<(), std::io::Error> {
            let file = File::create(path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            Ok(())
        };
        writer().map_err(|e| ConfigError::ExportError {
            file: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl<S: Serialize> Export for S {}

/// Runtime parameters of a node. Every field has a sensible default so a
/// configuration file only needs to name the values it overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameters {
    /// Byte budget of one gatherer buffer (per stage, per worker). The
    /// mapping is anonymous and committed lazily, so the budget bounds
    /// virtual, not resident, memory.
    #[serde(default = "Parameters::default_buffer_budget")]
    pub buffer_budget: usize,

    /// Byte budget of one output ring between a kernel thread and the
    /// scatterer.
    #[serde(default = "Parameters::default_output_buffer_budget")]
    pub output_buffer_budget: usize,

    /// Depth (in frames) of the send queue feeding each scatter channel.
    #[serde(default = "Parameters::default_channel_capacity")]
    pub channel_capacity: usize,

    /// Bytes to accumulate for a key before waking a blocked value
    /// iterator. Zero wakes on every append.
    #[serde(default)]
    pub value_watermark: usize,

    /// How long the peer waits for a freshly spawned worker process to
    /// report its RPC url on stdout.
    #[serde(default = "Parameters::default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,

    /// How long the cached peer roster stays fresh on a coordinator.
    #[serde(default = "Parameters::default_peer_refresh_ms")]
    pub peer_refresh_ms: u64,

    /// Bound on joining kernel threads during worker shutdown.
    #[serde(default = "Parameters::default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Test hook: force all scatter traffic through TCP even when the
    /// destination is the sending worker.
    #[serde(default)]
    pub disable_local_bypass: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            buffer_budget: Self::default_buffer_budget(),
            output_buffer_budget: Self::default_output_buffer_budget(),
            channel_capacity: Self::default_channel_capacity(),
            value_watermark: 0,
            spawn_timeout_ms: Self::default_spawn_timeout_ms(),
            peer_refresh_ms: Self::default_peer_refresh_ms(),
            shutdown_grace_ms: Self::default_shutdown_grace_ms(),
            disable_local_bypass: false,
        }
    }
}

impl Parameters {
    fn default_buffer_budget() -> usize {
        // Anonymous mappings cannot assume sparse-file behavior, so the
        // budget is far below the 32-bit address-space ceiling.
        if cfg!(target_pointer_width = "32") {
            100 * 1024 * 1024
        } else {
            1024 * 1024 * 1024
        }
    }

    fn default_output_buffer_budget() -> usize {
        64 * 1024 * 1024
    }

    fn default_channel_capacity() -> usize {
        1_000
    }

    fn default_spawn_timeout_ms() -> u64 {
        30_000
    }

    fn default_peer_refresh_ms() -> u64 {
        60_000
    }

    fn default_shutdown_grace_ms() -> u64 {
        10_000
    }

    pub fn tracing(&self) {
        info!("Gatherer buffer budget set to {} B", self.buffer_budget);
        info!(
            "Output buffer budget set to {} B",
            self.output_buffer_budget
        );
        info!("Scatter channel capacity set to {}", self.channel_capacity);
        info!("Value watermark set to {} B", self.value_watermark);
        info!("Worker spawn timeout set to {} ms", self.spawn_timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");
        std::fs::write(&path, r#"{ "value_watermark": 4096, "disable_local_bypass": true }"#)
            .unwrap();

        let parameters = Parameters::import(&path).unwrap();
        assert_eq!(parameters.value_watermark, 4096);
        assert!(parameters.disable_local_bypass);
        assert_eq!(
            parameters.spawn_timeout_ms,
            Parameters::default().spawn_timeout_ms
        );
    }

    #[test]
    fn export_then_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");

        let mut parameters = Parameters::default();
        parameters.channel_capacity = 7;
        parameters.export(&path).unwrap();

        let restored = Parameters::import(&path).unwrap();
        assert_eq!(restored.channel_capacity, 7);
    }
}
