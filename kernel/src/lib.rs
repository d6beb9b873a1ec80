// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod stock;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Unknown kernel kind '{0}'")]
    UnknownKind(String),
    #[error("Malformed kernel config for '{kind}': {message}")]
    MalformedConfig { kind: String, message: String },
    #[error("Malformed kernel chain: {0}")]
    MalformedChain(#[from] bincode::Error),
}

/// One stage of a map-reduce chain. A kernel consumes one key together
/// with the stream of values gathered for it, and emits any number of
/// `(key, value)` pairs for the next stage. Keys and values are opaque
/// byte strings end-to-end; only kernels interpret them.
///
/// Emission is streamed through the `emit` callback so a kernel never
/// needs to materialize its whole output.
pub trait Kernel: Send + Sync {
    fn invoke(
        &self,
        key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(Bytes, Bytes),
    );
}

impl std::fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Kernel")
    }
}

/// Wire form of a kernel: a registry tag plus an opaque config blob the
/// loader interprets. The chain `[K0 .. K(n-1)]` is serialized once by
/// the client and broadcast to every worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub kind: String,
    pub config: Bytes,
}

impl KernelSpec {
    pub fn new(kind: impl Into<String>, config: Bytes) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }
}

type Loader = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn Kernel>, KernelError> + Send + Sync>;

/// Maps kernel-kind tags to loaders turning config bytes into runnable
/// kernels. Worker processes resolve every spec of a chain through the
/// registry before the first stage runs.
#[derive(Default)]
pub struct KernelRegistry {
    loaders: RwLock<HashMap<String, Loader>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: impl Into<String>, loader: F)
    where
        F: Fn(&[u8]) -> Result<Arc<dyn Kernel>, KernelError> + Send + Sync + 'static,
    {
        self.loaders.write().insert(kind.into(), Arc::new(loader));
    }

    pub fn load(&self, spec: &KernelSpec) -> Result<Arc<dyn Kernel>, KernelError> {
        let loader = self
            .loaders
            .read()
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| KernelError::UnknownKind(spec.kind.clone()))?;
        loader(&spec.config)
    }

    pub fn load_chain(&self, specs: &[KernelSpec]) -> Result<Vec<Arc<dyn Kernel>>, KernelError> {
        specs.iter().map(|spec| self.load(spec)).collect()
    }
}

/// The registry every worker starts from, pre-populated with the stock
/// kernels.
pub fn default_registry() -> &'static KernelRegistry {
    static REGISTRY: Lazy<KernelRegistry> = Lazy::new(|| {
        let registry = KernelRegistry::new();
        stock::register(&registry);
        registry
    });
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_rejected() {
        let registry = KernelRegistry::new();
        let err = registry
            .load(&KernelSpec::new("no-such-kernel", Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownKind(_)));
    }

    #[test]
    fn default_registry_loads_stock_chain() {
        let chain = vec![stock::tokenize(), stock::sum()];
        let kernels = default_registry().load_chain(&chain).unwrap();
        assert_eq!(kernels.len(), 2);
    }
}
