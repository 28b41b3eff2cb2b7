// SPDX-License-Identifier: Apache-2.0

//! Errors for the master crate.
//!
//! The taxonomy: configuration errors surface at init, rendezvous errors
//! while bringing the fleet up, and everything raised by a running scheduler
//! coroutine is fatal to the step loop. Only transient stream-poll misses are
//! recovered locally (inside the stream helpers), never here.

use trainflow_config::{DataKey, ModelName, RpcName};

/// Errors raised by the master coordinator.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The experiment configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] trainflow_config::Error),

    /// A stream operation failed.
    #[error("Stream error: {0}")]
    Stream(#[from] trainflow_stream::Error),

    /// A batch operation failed.
    #[error("Data error: {0}")]
    Data(#[from] trainflow_data::Error),

    /// A worker replied with an unexpected payload variant.
    #[error("Protocol violation from `{handler}`: expected {expected} reply")]
    ProtocolViolation {
        /// The replying handler.
        handler: String,
        /// The expected payload variant.
        expected: &'static str,
    },

    /// The sequence buffer is over capacity.
    #[error("Sequence buffer is full (capacity {capacity})")]
    BufferFull {
        /// The advisory capacity that was exceeded.
        capacity: usize,
    },

    /// An operation referenced a buffer index that does not exist.
    #[error("Unknown buffer index {index}")]
    UnknownBufferIndex {
        /// The missing index.
        index: u64,
    },

    /// An amendment batch did not line up with its indices.
    #[error("Amendment count {amendments} does not match index count {indices}")]
    AmendMismatch {
        /// Number of indices addressed.
        indices: usize,
        /// Number of amendments supplied.
        amendments: usize,
    },

    /// Two producers claimed the same (sequence, key) pair.
    #[error(
        "Key `{key}` of sequence {index} already owned by `{first}` (dp {first_dp}), now claimed by `{second}` (dp {second_dp})"
    )]
    DuplicateOwner {
        /// The buffer index.
        index: u64,
        /// The contested key.
        key: DataKey,
        /// The recorded owner.
        first: ModelName,
        /// The recorded owner's dp rank.
        first_dp: usize,
        /// The conflicting claimant.
        second: ModelName,
        /// The conflicting claimant's dp rank.
        second_dp: usize,
    },

    /// An input key has no recorded owner for a sequence.
    #[error("No data owner recorded for key `{key}` of sequence {index}")]
    UnknownOwner {
        /// The buffer index.
        index: u64,
        /// The key with no owner.
        key: DataKey,
    },

    /// An input key's sequences are owned by more than one model.
    #[error("Key `{key}` of RPC `{rpc}` is owned by several models: {owners:?}")]
    AmbiguousOwner {
        /// The consuming RPC.
        rpc: RpcName,
        /// The key in question.
        key: DataKey,
        /// The distinct owners observed.
        owners: Vec<ModelName>,
    },

    /// A model's architecture card was needed before the worker reported it.
    #[error("No model config reported for `{model}`")]
    MissingModelConfig {
        /// The model whose card is missing.
        model: ModelName,
    },

    /// A replica needs a parameter-sync counterpart but none is configured.
    #[error("Replica `{model}` has no sync_param_pairs entry naming it as receiver")]
    MissingSyncPair {
        /// The orphaned replica.
        model: ModelName,
    },

    /// Two primary handlers of one request resolve to the same worker.
    #[error("Handlers of RPC `{rpc}` collide on worker {worker}")]
    WorkerCollision {
        /// The RPC being posted.
        rpc: RpcName,
        /// The doubly addressed worker.
        worker: usize,
    },

    /// A scheduler invariant broke; the step loop cannot continue.
    #[error("Internal error: {message}")]
    Internal {
        /// What broke.
        message: String,
    },
}
