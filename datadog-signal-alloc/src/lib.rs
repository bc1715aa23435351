// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory allocation primitives safe to call from a signal handler.
//!
//! Profiler code that runs inside an asynchronous signal handler cannot use
//! the process heap, locks, or most of libc. The allocators in this crate
//! are backed directly by anonymous page mappings and hand out memory with
//! atomic bumps, which keeps them usable in that context.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod chain;
mod page;
mod utils;

pub use chain::*;
pub use page::*;

// Expose the allocator traits for our users.
pub use allocator_api2::alloc::{AllocError, Allocator};
