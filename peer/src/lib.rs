// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod coordinator;
mod peer;

pub use coordinator::*;
pub use peer::*;
