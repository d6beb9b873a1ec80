// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod buffer;
mod gatherer;
mod output_buffer;
mod scatterer;
mod worker;

pub use buffer::*;
pub use gatherer::*;
pub use output_buffer::*;
pub use scatterer::*;
pub use worker::*;
