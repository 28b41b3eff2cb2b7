// SPDX-License-Identifier: Apache-2.0

//! Shared coroutine control state.
//!
//! One instance is shared (via `Rc`) by every scheduler task. Per-RPC
//! resources live in [`RpcControl`]: the concurrency semaphore, the traversal
//! counter and the senders of the size-1 mailboxes that pair the request
//! coroutine with its reply coroutines. Global resources are the stop token,
//! the terminal-completion channel and the fetch/eval/save command queues.

use crate::stats::InterfaceDataAmount;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trainflow_config::RpcName;
use trainflow_stream::RequestId;

/// One in-flight invocation handed from a request coroutine to a reply
/// coroutine through its mailbox.
#[derive(Debug)]
pub struct Inflight {
    /// Final-reply ids of the primary handlers, in parallelism-rank order.
    pub request_ids: Vec<RequestId>,
    /// Final-reply ids of side-participant payloads.
    pub side_request_ids: Vec<RequestId>,
    /// When the request group was posted.
    pub started: Instant,
}

/// Per-RPC concurrency state.
pub struct RpcControl {
    /// Bounds in-flight invocations to `max_concurrent_calls`. Acquired by
    /// the request coroutine, released by whichever reply coroutine finishes
    /// the invocation.
    pub semaphore: Rc<Semaphore>,
    /// Completed traversals of this RPC.
    pub traversal: Cell<u64>,
    /// Mailbox senders, one per reply coroutine, used round-robin.
    pub mailboxes: Vec<mpsc::Sender<Inflight>>,
}

/// Control state shared by every scheduler coroutine.
pub struct CoroutineControl {
    /// Cooperative stop signal; every coroutine returns at its next
    /// suspension once cancelled.
    pub stop: CancellationToken,
    /// Terminal-RPC completion channel; the driver counts one step once every
    /// terminal RPC has fired.
    pub train_count: mpsc::Sender<()>,
    /// Per-RPC state, by name.
    pub rpcs: HashMap<RpcName, RpcControl>,
    /// Buffer indices consumed by source RPCs in the current step; drained by
    /// the driver into `clear_data_cache`.
    pub training_buffer_indices: RefCell<BTreeSet<u64>>,
    /// Per-step data-volume accumulator for throughput reporting.
    pub data_amount: RefCell<InterfaceDataAmount>,
}

impl CoroutineControl {
    /// The control block of `rpc`.
    ///
    /// Panics only on a scheduler bug: every RPC is registered at spawn.
    #[must_use]
    pub fn rpc(&self, rpc: &RpcName) -> &RpcControl {
        self.rpcs
            .get(rpc)
            .unwrap_or_else(|| unreachable!("RPC `{rpc}` not registered"))
    }

    /// The completed traversal count of `rpc`.
    #[must_use]
    pub fn traversal(&self, rpc: &RpcName) -> u64 {
        self.rpc(rpc).traversal.get()
    }
}
