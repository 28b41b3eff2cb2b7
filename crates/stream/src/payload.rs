// SPDX-License-Identifier: Apache-2.0

//! Payload and hook wire shapes.
//!
//! `data` is a tagged sum rather than an open dictionary: every handle kind
//! documents exactly which variant it carries (see the table in the crate
//! README of the master). Hooks are tagged the same way; a hook's payload
//! identifies the hook, so there is no separate hook-name channel.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use trainflow_config::{DataKey, ModelConfig, ModelName, ModelShardId, RpcName, Topology};
use trainflow_data::{DataBatch, FinetuneSpec, SeqSample};
use uuid::Uuid;

/// Identifier of one posted request (or one of its auxiliary reply slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An exact-match set of request ids for polling replies.
#[derive(Debug, Clone, Default)]
pub struct ReplyPattern {
    ids: HashSet<RequestId>,
}

impl ReplyPattern {
    /// A pattern matching exactly the given ids.
    #[must_use]
    pub fn exact<I: IntoIterator<Item = RequestId>>(ids: I) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Whether `id` is matched.
    #[must_use]
    pub fn matches(&self, id: &RequestId) -> bool {
        self.ids.contains(id)
    }
}

/// Address of a request handler on the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerId {
    /// A model shard.
    Shard(Box<ModelShardId>),
    /// A data worker, by data-parallel index of the source model.
    Data(usize),
}

impl HandlerId {
    /// Addresses a model shard.
    #[must_use]
    pub fn shard(shard: ModelShardId) -> Self {
        HandlerId::Shard(Box::new(shard))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerId::Shard(shard) => shard.fmt(f),
            HandlerId::Data(i) => write!(f, "data{i}"),
        }
    }
}

/// The named handler a payload invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// Autoregressive generation over the addressed batch.
    Generate,
    /// Forward pass without gradient.
    Inference,
    /// One optimizer step.
    TrainStep,
    /// Collective model initialization with the finetune spec.
    Initialize,
    /// One-shot architecture card request.
    ModelConfig,
    /// Fetch the next dataset chunk (data workers only).
    Fetch,
    /// Associate fetched sequences with buffer indices (data workers only).
    Store,
    /// One-shot finetune-spec request (data worker 0 only).
    Spec,
    /// Collective evaluation pass.
    Evaluate,
    /// Checkpoint to a named directory (replica 0 only).
    Save,
    /// No-op carrier for hooks.
    Empty,
    /// Handshake acknowledgement.
    Ack,
    /// Drop per-sequence worker state for the given buffer indices.
    ClearDataCache,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandleKind::Generate => "generate",
            HandleKind::Inference => "inference",
            HandleKind::TrainStep => "train_step",
            HandleKind::Initialize => "initialize",
            HandleKind::ModelConfig => "model_config",
            HandleKind::Fetch => "fetch",
            HandleKind::Store => "store",
            HandleKind::Spec => "spec",
            HandleKind::Evaluate => "evaluate",
            HandleKind::Save => "save",
            HandleKind::Empty => "empty",
            HandleKind::Ack => "ack",
            HandleKind::ClearDataCache => "clear_data_cache",
        };
        write!(f, "{label}")
    }
}

impl From<trainflow_config::ModelInterfaceType> for HandleKind {
    fn from(value: trainflow_config::ModelInterfaceType) -> Self {
        match value {
            trainflow_config::ModelInterfaceType::Generate => HandleKind::Generate,
            trainflow_config::ModelInterfaceType::Inference => HandleKind::Inference,
            trainflow_config::ModelInterfaceType::TrainStep => HandleKind::TrainStep,
        }
    }
}

/// Payload data, tagged by content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadData {
    /// The finetune spec (`spec` reply, `initialize` request).
    Spec(FinetuneSpec),
    /// A model architecture card (`model_config` reply).
    ModelConfig(ModelConfig),
    /// A fetched dataset chunk (`fetch` reply).
    DataBatch(Box<DataBatch>),
    /// A packed sample (metadata only).
    Sample(SeqSample),
    /// Outcome header of a model call: which keys were produced for which
    /// sequences, plus optional log scalars from train/inference.
    BatchReply {
        /// Produced attribute keys, already remapped for the buffer.
        keys: Vec<DataKey>,
        /// Per-sequence lengths of the replying data slice.
        seqlens: Vec<u32>,
        /// Buffer indices of the replying data slice.
        buffer_indices: Vec<u64>,
        /// Scalar logs, if the interface returned any.
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        scalars: IndexMap<String, f64>,
    },
    /// Scalar logs (`evaluate` reply).
    Scalars(IndexMap<String, f64>),
    /// Buffer indices (`store` request, `clear_data_cache` request).
    Indices(Vec<u64>),
    /// Checkpoint directory (`save` request).
    SaveDir(PathBuf),
    /// Nothing.
    Empty,
}

/// Parameter-reallocation hook data: both endpoints of the transfer, so that
/// every participating worker can derive its part of the collective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamReallocSpec {
    /// Model currently holding the parameters.
    pub from_model_name: ModelName,
    /// Model receiving the parameters.
    pub to_model_name: ModelName,
    /// Topology of the sender.
    pub from_topo: Topology,
    /// Topology of the receiver.
    pub to_topo: Topology,
    /// Architecture card of the receiver, for shard layout derivation.
    pub to_model_config: ModelConfig,
}

/// Positions of a batch owned by one producer's data slices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerMapping {
    /// The model whose dp layout owns the data.
    pub producer: ModelName,
    /// The attribute key being routed.
    pub key: DataKey,
    /// For each producer dp rank, the sorted batch positions it holds.
    pub positions_per_dp: Vec<Vec<usize>>,
}

/// Cross-topology routing descriptor shipped as the `data_transfer` pre-hook.
///
/// Workers use it to run the NCCL-level gather/scatter themselves; the master
/// never touches tensor bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransferSpec {
    /// The RPC this transfer feeds.
    pub rpc_name: RpcName,
    /// The interface that will consume the data.
    pub handle_name: HandleKind,
    /// The consuming model.
    pub target: ModelName,
    /// Input keys to route.
    pub keys: Vec<DataKey>,
    /// Where each key currently lives.
    pub producer_mappings: Vec<ProducerMapping>,
    /// For each target dp rank, the batch positions it will receive.
    pub target_mapping: Vec<Vec<usize>>,
    /// Renames applied to input keys at the worker interface.
    pub input_key_remap: IndexMap<DataKey, DataKey>,
    /// Renames applied to output keys before they enter the buffer.
    pub output_key_remap: IndexMap<DataKey, DataKey>,
    /// Buffer indices of the batch, in batch order.
    pub buffer_indices: Vec<u64>,
    /// Per-sequence lengths of the batch, in batch order.
    pub seqlens: Vec<u32>,
}

/// Offload hook data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadSpec {
    /// The model whose parameters move to host memory.
    pub model_name: ModelName,
}

/// A pre/post side effect attached to a payload. The variant identifies the
/// hook; the fields are its wire data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCall {
    /// Collective parameter reallocation between two replicas.
    ParamRealloc(Box<ParamReallocSpec>),
    /// Offload the named model's parameters to host memory.
    Offload(Box<OffloadSpec>),
    /// Cross-topology input routing for a model call.
    DataTransfer(Box<DataTransferSpec>),
}

impl HookCall {
    /// The wire id of this hook.
    #[must_use]
    pub const fn id(&self) -> &'static str {
        match self {
            HookCall::ParamRealloc(_) => "param_realloc",
            HookCall::Offload(_) => "offload",
            HookCall::DataTransfer(_) => "data_transfer",
        }
    }
}

/// One request on the stream.
///
/// Posting a payload implicitly allocates two auxiliary reply slots: the
/// worker replies on `syn_reply_id` as soon as the request is enqueued
/// locally, the master posts an `ack` on `ack_reply_id`, and only then the
/// worker executes and finally replies on `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// The addressed handler.
    pub handler: HandlerId,
    /// The handler entry point.
    pub handle_name: HandleKind,
    /// Reply slot for the final reply.
    pub request_id: RequestId,
    /// Reply slot for the worker's SYN.
    pub syn_reply_id: RequestId,
    /// Reply slot for the master's ACK.
    pub ack_reply_id: RequestId,
    /// The request data.
    pub data: PayloadData,
    /// Hooks executed before the handler.
    pub pre_hooks: Vec<HookCall>,
    /// Hooks executed after the handler.
    pub post_hooks: Vec<HookCall>,
}

impl Payload {
    /// Creates a request with fresh ids and no hooks.
    #[must_use]
    pub fn new(handler: HandlerId, handle_name: HandleKind, data: PayloadData) -> Self {
        Self {
            handler,
            handle_name,
            request_id: RequestId::generate(),
            syn_reply_id: RequestId::generate(),
            ack_reply_id: RequestId::generate(),
            data,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// Creates the ACK for this request, addressed back at its handler.
    #[must_use]
    pub fn ack(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            handle_name: HandleKind::Ack,
            request_id: self.ack_reply_id,
            syn_reply_id: RequestId::generate(),
            ack_reply_id: RequestId::generate(),
            data: PayloadData::Empty,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// Creates a reply carrying `data` on the given reply slot.
    #[must_use]
    pub fn reply(handler: HandlerId, reply_id: RequestId, data: PayloadData) -> Self {
        Self {
            handler,
            handle_name: HandleKind::Empty,
            request_id: reply_id,
            syn_reply_id: RequestId::generate(),
            ack_reply_id: RequestId::generate(),
            data,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// Appends a pre- or post-hook.
    pub fn push_hook(&mut self, hook: HookCall, post: bool) {
        if post {
            self.post_hooks.push(hook);
        } else {
            self.pre_hooks.push(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_payload_ids_are_distinct() {
        let p = Payload::new(HandlerId::Data(0), HandleKind::Fetch, PayloadData::Empty);
        assert_ne!(p.request_id, p.syn_reply_id);
        assert_ne!(p.request_id, p.ack_reply_id);
        assert_ne!(p.syn_reply_id, p.ack_reply_id);
    }

    #[test]
    fn ack_targets_the_ack_reply_slot() {
        let p = Payload::new(HandlerId::Data(1), HandleKind::Fetch, PayloadData::Empty);
        let ack = p.ack();
        assert_eq!(ack.handler, p.handler);
        assert_eq!(ack.handle_name, HandleKind::Ack);
        assert_eq!(ack.request_id, p.ack_reply_id);
    }

    #[test]
    fn pattern_matches_only_listed_ids() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        let pattern = ReplyPattern::exact([a]);
        assert!(pattern.matches(&a));
        assert!(!pattern.matches(&b));
    }
}
