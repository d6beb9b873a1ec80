// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod clients;
mod codec;
pub mod directory;
mod receiver;
mod rpc;

pub use clients::*;
pub use codec::*;
pub use receiver::*;
pub use rpc::*;
