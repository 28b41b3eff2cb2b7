// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.
//!
//! Everything here is a configuration error in the taxonomy of the system:
//! detected once at init, never recovered from.

use crate::model::{ModelName, ModelShardId};
use crate::{DataKey, RpcName};
use miette::Diagnostic;

/// Errors raised while building or validating an experiment configuration.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A collection of errors found while validating the configuration.
    #[error("Invalid experiment configuration: {errors:?}")]
    #[diagnostic(code(trainflow::invalid_configuration))]
    InvalidConfiguration {
        /// Every validation error found.
        #[related]
        errors: Vec<Error>,
    },

    /// Two RPCs share the same name.
    #[error("Duplicated RPC name `{name}`")]
    #[diagnostic(code(trainflow::duplicate_rpc))]
    DuplicateRpc {
        /// The duplicated name.
        name: RpcName,
    },

    /// The dataflow graph contains a cycle.
    #[error("Cycle detected involving RPCs: {nodes:?}")]
    #[diagnostic(code(trainflow::cycle_detected))]
    CycleDetected {
        /// The RPCs left unordered by the topological sort.
        nodes: Vec<RpcName>,
    },

    /// No RPC is a source (every RPC has DFG parents).
    #[error("The dataflow graph has no source RPC")]
    #[diagnostic(code(trainflow::no_source_rpc))]
    NoSourceRpc,

    /// No RPC is terminal (every RPC has DFG children).
    #[error("The dataflow graph has no terminal RPC")]
    #[diagnostic(code(trainflow::no_terminal_rpc))]
    NoTerminalRpc,

    /// Two RPCs produce the same buffer key. The data-owner registry requires
    /// a unique producer per (sequence, key) pair, so this is rejected
    /// outright rather than left to undefined runtime behavior.
    #[error("Key `{key}` is produced by both `{first}` and `{second}`")]
    #[diagnostic(code(trainflow::duplicate_producer))]
    DuplicateProducer {
        /// The contested key.
        key: DataKey,
        /// The first producer found.
        first: RpcName,
        /// The second producer found.
        second: RpcName,
    },

    /// An RPC declares `min_n_seqs > max_n_seqs`.
    #[error("RPC `{rpc}` has min_n_seqs {min} > max_n_seqs {max}")]
    #[diagnostic(code(trainflow::batch_size_range))]
    BatchSizeRange {
        /// The offending RPC.
        rpc: RpcName,
        /// Its declared minimum.
        min: usize,
        /// Its declared maximum.
        max: usize,
    },

    /// An RPC declares `max_concurrent_calls == 0`.
    #[error("RPC `{rpc}` must allow at least one concurrent call")]
    #[diagnostic(code(trainflow::zero_concurrency))]
    ZeroConcurrency {
        /// The offending RPC.
        rpc: RpcName,
    },

    /// A parameter-sync hook names both endpoints or neither.
    #[error("RPC `{rpc}` carries a sync hook that must name exactly one of source/target")]
    #[diagnostic(code(trainflow::invalid_hook_endpoints))]
    InvalidHookEndpoints {
        /// The RPC carrying the hook.
        rpc: RpcName,
    },

    /// A model is referenced but not deployed.
    #[error("Model `{model}` is referenced by `{referrer}` but has no deployment")]
    #[diagnostic(code(trainflow::unknown_model))]
    UnknownModel {
        /// The missing model.
        model: ModelName,
        /// The RPC, hook or producer override referencing it.
        referrer: String,
    },

    /// A deployed model declares a topology with a zero dimension.
    #[error("Model `{model}` has a degenerate topology (zero dimension)")]
    #[diagnostic(code(trainflow::degenerate_topology))]
    DegenerateTopology {
        /// The offending model.
        model: ModelName,
    },

    /// A model shard has no worker placement.
    #[error("Shard `{shard}` has no worker placement")]
    #[diagnostic(code(trainflow::missing_placement))]
    MissingPlacement {
        /// The unplaced shard.
        shard: ModelShardId,
    },

    /// A model shard is placed on more than one worker.
    #[error("Shard `{shard}` is placed more than once")]
    #[diagnostic(code(trainflow::duplicate_placement))]
    DuplicatePlacement {
        /// The doubly placed shard.
        shard: ModelShardId,
    },

    /// An input-key producer override points at a model that never produces
    /// the key.
    #[error("RPC `{rpc}` expects key `{key}` from `{producer}`, which never produces it")]
    #[diagnostic(code(trainflow::unproducible_key))]
    UnproducibleKey {
        /// The consuming RPC.
        rpc: RpcName,
        /// The key in question.
        key: DataKey,
        /// The producer named by the override.
        producer: ModelName,
    },
}
