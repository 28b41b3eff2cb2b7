// SPDX-License-Identifier: Apache-2.0

//! The trainflow master coordinator.
//!
//! One master drives a fleet of model workers (one shard per accelerator)
//! and a handful of data workers through a user-defined dataflow graph of
//! model RPCs. The pieces:
//!
//! - [`buffer::SequenceBuffer`] — the asynchronous rendezvous between data
//!   producers and consumers, keyed by buffer index.
//! - [`registry::DataOwner`] — which model/dp-rank currently holds each
//!   (sequence, key) pair, for routing across heterogeneous topologies.
//! - [`coroutines`] — one request task plus `max_concurrent_calls` reply
//!   tasks per RPC, plus data-loading, evaluation and save tasks.
//! - [`hooks`] — resolves parameter-realloc and offload hooks onto the right
//!   set of worker payloads, including side participants.
//! - [`driver::MasterDriver`] — init rendezvous, the step loop, save/eval
//!   cadence, benchmark exit and per-step cache clearing.
//!
//! Everything runs as `!Send` tasks on one current-thread runtime: tasks
//! yield only at buffer waits, mailbox hand-offs and reply polls, and the
//! only cross-task mutable state (the buffer and the owner registry) is
//! guarded by that cooperative single-threadedness.

pub mod buffer;
pub mod context;
pub mod control;
pub mod coroutines;
pub mod driver;
pub mod error;
pub mod freq;
pub mod hooks;
pub mod registry;
pub mod stats;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use buffer::{Batch, SequenceBuffer};
pub use driver::{CompletionReason, MasterDriver, RunSummary};
pub use error::Error;
pub use registry::DataOwner;
