// SPDX-License-Identifier: Apache-2.0

//! Trainflow experiment configuration.
//!
//! Data model:
//! - experiment
//!   - model deployments (a named model replica pinned to a parallelism topology)
//!   - shard placements (which worker process owns which model shard)
//!   - model RPCs, interconnected in a directed acyclic dataflow graph (DFG)
//!
//! The master coordinator consumes this model verbatim: the DFG drives the
//! scheduler, topologies drive data routing across heterogeneous parallelism
//! layouts, and placements drive request addressing. Everything in this crate
//! is plain data; validation happens once at init and the rest of the system
//! assumes a well-formed experiment.

use std::borrow::Cow;

pub mod dfg;
pub mod error;
pub mod experiment;
pub mod model;
pub mod rpc;

/// The unique name of a model RPC (a node of the DFG).
pub type RpcName = Cow<'static, str>;

/// The name of a data attribute attached to a sequence (e.g. `packed_seq`,
/// `rewards`, `ref_logp`).
pub type DataKey = Cow<'static, str>;

/// The role part of a model name (e.g. `actor`, `critic`, `reward`).
pub type RoleName = Cow<'static, str>;

/// Identifier of a worker process. Each worker owns one accelerator and may
/// host shards of several models.
pub type WorkerId = usize;

pub use dfg::DataflowGraph;
pub use error::Error;
pub use experiment::{ExperimentConfig, ExperimentControls, FreqSpec};
pub use model::{ModelConfig, ModelName, ModelShardId, ParallelCoord, Topology};
pub use rpc::{Hook, ModelInterfaceType, ModelRpc};
