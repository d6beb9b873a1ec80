// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Stock kernels shipped with every node. They cover the common demo
//! pipelines (word count, bucketed sums) and give tests deterministic
//! building blocks. Values are bincode-encoded; a kernel that decodes a
//! value defines the type it expects.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{Kernel, KernelError, KernelRegistry, KernelSpec};

pub const IDENTITY: &str = "identity";
pub const TOKENIZE: &str = "tokenize";
pub const SUM: &str = "sum";
pub const BUCKET: &str = "bucket";
pub const SILENT: &str = "silent";
pub const THROTTLE: &str = "throttle";

pub(crate) fn register(registry: &KernelRegistry) {
    registry.register(IDENTITY, |_| Ok(Arc::new(Identity)));
    registry.register(TOKENIZE, |_| Ok(Arc::new(Tokenize)));
    registry.register(SUM, |_| Ok(Arc::new(Sum)));
    registry.register(BUCKET, |config| {
        let modulus: u64 = decode_config(BUCKET, config)?;
        Ok(Arc::new(Bucket { modulus }))
    });
    registry.register(SILENT, |_| Ok(Arc::new(Silent)));
    registry.register(THROTTLE, |config| {
        let delay_ms: u64 = decode_config(THROTTLE, config)?;
        Ok(Arc::new(Throttle { delay_ms }))
    });
}

fn decode_config<T: serde::de::DeserializeOwned>(kind: &str, config: &[u8]) -> Result<T, KernelError> {
    bincode::deserialize(config).map_err(|e| KernelError::MalformedConfig {
        kind: kind.to_string(),
        message: e.to_string(),
    })
}

pub fn identity() -> KernelSpec {
    KernelSpec::new(IDENTITY, Bytes::new())
}

pub fn tokenize() -> KernelSpec {
    KernelSpec::new(TOKENIZE, Bytes::new())
}

pub fn sum() -> KernelSpec {
    KernelSpec::new(SUM, Bytes::new())
}

pub fn bucket(modulus: u64) -> KernelSpec {
    KernelSpec::new(BUCKET, encode(&modulus))
}

pub fn silent() -> KernelSpec {
    KernelSpec::new(SILENT, Bytes::new())
}

pub fn throttle(delay_ms: u64) -> KernelSpec {
    KernelSpec::new(THROTTLE, encode(&delay_ms))
}

fn encode<T: serde::Serialize>(value: &T) -> Bytes {
    Bytes::from(bincode::serialize(value).expect("serializing a kernel config cannot fail"))
}

/// Re-emits every `(key, value)` pair unchanged.
struct Identity;

impl Kernel for Identity {
    fn invoke(
        &self,
        key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(Bytes, Bytes),
    ) {
        for value in values {
            emit(key.clone(), value);
        }
    }
}

/// Splits string values on whitespace and emits `(word, 1u64)` pairs,
/// keyed by the word.
struct Tokenize;

impl Kernel for Tokenize {
    fn invoke(
        &self,
        _key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(Bytes, Bytes),
    ) {
        let one = encode(&1u64);
        for value in values {
            let text: String = match bincode::deserialize(&value) {
                Ok(text) => text,
                Err(_) => continue,
            };
            for word in text.split_whitespace() {
                emit(encode(&word), one.clone());
            }
        }
    }
}

/// Sums u64 values and emits a single `(key, total)` pair.
struct Sum;

impl Kernel for Sum {
    fn invoke(
        &self,
        key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(Bytes, Bytes),
    ) {
        let mut total = 0u64;
        for value in values {
            if let Ok(n) = bincode::deserialize::<u64>(&value) {
                total += n;
            }
        }
        emit(key, encode(&total));
    }
}

/// Re-keys u64 values by `value % modulus`.
struct Bucket {
    modulus: u64,
}

impl Kernel for Bucket {
    fn invoke(
        &self,
        _key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(Bytes, Bytes),
    ) {
        for value in values {
            if let Ok(n) = bincode::deserialize::<u64>(&value) {
                emit(encode(&(n % self.modulus)), value);
            }
        }
    }
}

/// Consumes everything and emits nothing.
struct Silent;

impl Kernel for Silent {
    fn invoke(
        &self,
        _key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        _emit: &mut dyn FnMut(Bytes, Bytes),
    ) {
        for _ in values {}
    }
}

/// Passes values through keyed by their own bytes, sleeping between
/// emissions. Paces a pipeline so tests can observe it mid-flight.
struct Throttle {
    delay_ms: u64,
}

impl Kernel for Throttle {
    fn invoke(
        &self,
        _key: Bytes,
        values: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(Bytes, Bytes),
    ) {
        for value in values {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            emit(value.clone(), value);
        }
    }
}
