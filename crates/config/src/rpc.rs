// SPDX-License-Identifier: Apache-2.0

//! Model RPC descriptions: the nodes of the dataflow graph.

use crate::model::ModelName;
use crate::{DataKey, RpcName};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of model call an RPC performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelInterfaceType {
    /// Autoregressive generation (rollout).
    Generate,
    /// A forward pass without gradient (e.g. reward or reference scoring).
    Inference,
    /// One optimizer step over the batch.
    TrainStep,
}

impl fmt::Display for ModelInterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModelInterfaceType::Generate => "generate",
            ModelInterfaceType::Inference => "inference",
            ModelInterfaceType::TrainStep => "train_step",
        };
        write!(f, "{label}")
    }
}

/// A side effect that must run before or after an RPC, executed by a
/// superset of the RPC's primary handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Reallocate parameters between two model replicas.
    ///
    /// Exactly one endpoint is given; the omitted side defaults to the model
    /// of the RPC carrying the hook. All workers holding shards of either
    /// endpoint participate in the transfer collectively.
    SyncParam {
        /// Source model, or `None` for this RPC's model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ModelName>,
        /// Target model, or `None` for this RPC's model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ModelName>,
    },
    /// Offload this RPC's model parameters to host memory.
    Offload,
}

impl Hook {
    /// Whether the hook's endpoints are well-formed (sync hooks name exactly
    /// one side; offload carries none).
    #[must_use]
    pub const fn endpoints_valid(&self) -> bool {
        match self {
            Hook::SyncParam { source, target } => source.is_some() != target.is_some(),
            Hook::Offload => true,
        }
    }
}

fn default_one() -> usize {
    1
}

fn is_one(v: &usize) -> bool {
    *v == 1
}

/// One node of the dataflow graph: a named, atomic invocation of a model
/// interface over a batch of sequences.
///
/// Edges of the graph are implied by keys: this RPC depends on every RPC
/// whose (remapped) output keys intersect its input keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRpc {
    /// Unique name of this RPC within the experiment.
    pub name: RpcName,
    /// The model replica this RPC runs on.
    pub model_name: ModelName,
    /// The model interface invoked by this RPC.
    pub interface_type: ModelInterfaceType,
    /// Attribute keys this RPC consumes. A sequence is ready for this RPC
    /// once all of them are present.
    pub input_keys: Vec<DataKey>,
    /// Attribute keys this RPC produces (before remapping).
    #[serde(default)]
    pub output_keys: Vec<DataKey>,
    /// Renames applied to input keys before they reach the worker interface.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub input_key_remap: IndexMap<DataKey, DataKey>,
    /// Renames applied to output keys before they enter the buffer.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub output_key_remap: IndexMap<DataKey, DataKey>,
    /// Minimum number of sequences per invocation.
    pub min_n_seqs: usize,
    /// Maximum number of sequences per invocation.
    pub max_n_seqs: usize,
    /// Minimum number of sequences per data-parallel slice.
    #[serde(default = "default_one", skip_serializing_if = "is_one")]
    pub min_n_seqs_per_dp: usize,
    /// Round the batch down to a multiple of the model's dp size.
    #[serde(default)]
    pub balanced_dp: bool,
    /// Number of invocations that may be in flight concurrently.
    #[serde(default = "default_one", skip_serializing_if = "is_one")]
    pub max_concurrent_calls: usize,
    /// Log the gathered return value of every invocation.
    #[serde(default)]
    pub log_return_value: bool,
    /// Per-key override of the model whose dp layout owns the input data.
    /// Keys not listed here default to the model of the source RPC.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub data_producers: IndexMap<DataKey, ModelName>,
    /// Hooks executed before the model call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_hooks: Vec<Hook>,
    /// Hooks executed after the model call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_hooks: Vec<Hook>,
}

impl ModelRpc {
    /// The buffer-visible name of output key `key`, after remapping.
    #[must_use]
    pub fn produced_key<'a>(&'a self, key: &'a DataKey) -> &'a DataKey {
        self.output_key_remap.get(key).unwrap_or(key)
    }

    /// All buffer-visible output keys, after remapping.
    pub fn produced_keys(&self) -> impl Iterator<Item = &DataKey> {
        self.output_keys.iter().map(|k| self.produced_key(k))
    }

    /// Whether this RPC produces buffer-visible key `key`.
    #[must_use]
    pub fn produces(&self, key: &DataKey) -> bool {
        self.produced_keys().any(|k| k == key)
    }
}
