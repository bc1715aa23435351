// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free interning of sampled call traces.
//!
//! A sampling profiler hands every captured stack to
//! [`CallTraceStorage::put`] and receives a small identifier to attach to
//! the sample instead of the stack itself. The storage deduplicates stacks
//! by 64-bit hash, keeps one canonical copy of each payload in a
//! signal-safe arena, and supports draining the whole table with
//! [`CallTraceStorage::collect`].
//!
//! Writers may call `put` concurrently from arbitrary threads, including
//! from asynchronous signal handlers: the hot path takes no locks, performs
//! no heap allocation, and the only OS call it can make is a fresh page
//! mapping when a table or arena chunk fills up.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod generation;
mod hash;
mod storage;
mod trace;

pub use storage::{CallTraceStorage, StorageError};
pub use trace::{CallFrame, CallTrace};
