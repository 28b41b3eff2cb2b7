// SPDX-License-Identifier: Apache-2.0

//! In-process simulated worker fleet.
//!
//! Spawns one `!Send` task per worker id over a [`LocalStream`], speaking the
//! full payload protocol: handshake, hooks, dataset fetches, model calls and
//! cache clears. Workers fabricate replies from the routing descriptors the
//! master ships them and record everything they see, so integration tests
//! can assert on scheduling behavior without any model runtime.

use crate::error::Error;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::task::JoinHandle;
use trainflow_config::{
    DataKey, ExperimentConfig, ModelConfig, ModelName, RpcName, WorkerId,
};
use trainflow_data::{BlobSpec, DType, DataBatch, FinetuneSpec, SeqSample, TensorData};
use trainflow_stream::local::{LocalStream, WorkerEndpoint};
use trainflow_stream::{HandleKind, HandlerId, HookCall, Payload, PayloadData};

/// Knobs of the simulated fleet.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Attribute keys of every dataset sequence (besides `input_lens`).
    pub dataset_keys: Vec<String>,
    /// Per-sequence lengths of one full epoch, split contiguously and evenly
    /// across the data workers.
    pub epoch_seqlens: Vec<u32>,
    /// Sequences returned per `fetch`.
    pub chunk_size: usize,
    /// Tokens the simulated generator appends to each sequence.
    pub gen_new_tokens: u32,
    /// Reported `batch_size_per_device`.
    pub batch_size_per_device: usize,
    /// Reported `steps_per_epoch`.
    pub steps_per_epoch: u64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            dataset_keys: vec!["packed_seq".to_owned()],
            epoch_seqlens: vec![128; 16],
            chunk_size: 16,
            gen_new_tokens: 16,
            batch_size_per_device: 16,
            steps_per_epoch: 1,
        }
    }
}

/// One observed hook execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    /// The executing worker.
    pub worker: WorkerId,
    /// The handle kind of the carrier payload.
    pub carrier: HandleKind,
    /// The hook's wire id.
    pub hook: &'static str,
}

/// One observed cross-topology transfer, recorded once per request group by
/// the dp-0 head of the target model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// The RPC the transfer fed.
    pub rpc: RpcName,
    /// Producer of every routed key.
    pub producers: Vec<(DataKey, ModelName)>,
    /// Sequences per target dp slice.
    pub slice_sizes: Vec<usize>,
}

/// Everything the fleet observed, in arrival order.
#[derive(Debug, Default)]
pub struct FleetLog {
    /// (worker, handle) per accepted payload, in execution order.
    pub accepts: Vec<(WorkerId, HandleKind)>,
    /// Every executed hook.
    pub hooks: Vec<HookRecord>,
    /// Every observed data transfer.
    pub transfers: Vec<TransferRecord>,
    /// Every checkpoint request, with its directory.
    pub saves: Vec<(WorkerId, PathBuf)>,
    /// Every cache clear, with the dropped indices.
    pub clears: Vec<(WorkerId, Vec<u64>)>,
}

impl FleetLog {
    /// Number of accepted payloads of `kind` across the fleet.
    #[must_use]
    pub fn count(&self, kind: HandleKind) -> usize {
        self.accepts.iter().filter(|(_, k)| *k == kind).count()
    }
}

/// A running simulated fleet.
pub struct SimFleet {
    /// The fleet's shared observation log.
    pub log: Rc<RefCell<FleetLog>>,
    _tasks: Vec<JoinHandle<()>>,
}

struct DataCursor {
    seqlens: Vec<u32>,
    pos: usize,
    epoch: u64,
}

struct WorkerState {
    log: Rc<RefCell<FleetLog>>,
    rpc_outputs: Rc<HashMap<RpcName, Vec<DataKey>>>,
    cursors: HashMap<usize, DataCursor>,
    options: SimOptions,
    card: ModelConfig,
}

/// Builds the local stream for `config`'s placements and spawns one worker
/// task per worker id. Must be called inside a `LocalSet`.
pub fn spawn_fleet(
    config: &ExperimentConfig,
    options: SimOptions,
) -> Result<(LocalStream, SimFleet), Error> {
    let graph = config.validate()?;

    let rpc_outputs: Rc<HashMap<RpcName, Vec<DataKey>>> = Rc::new(
        graph
            .rpcs()
            .iter()
            .map(|r| (r.name.clone(), r.output_keys.clone()))
            .collect(),
    );

    let src_rpc = graph.sources().next().ok_or_else(|| Error::Internal {
        message: "no source RPC".to_owned(),
    })?;
    let src_model = graph.rpc(src_rpc).model_name.clone();
    let src_topo = config.topology(&src_model).ok_or_else(|| Error::Internal {
        message: format!("no topology for `{src_model}`"),
    })?;

    let mut routing = HashMap::new();
    let placement = config.placement_map();
    for (shard, worker) in &placement {
        let _ = routing.insert(HandlerId::shard(shard.clone()), *worker);
    }
    let mut data_workers: HashMap<usize, WorkerId> = HashMap::new();
    for dp in 0..src_topo.data {
        let head = src_topo.dp_head_rank(dp).ok_or_else(|| Error::Internal {
            message: "degenerate source topology".to_owned(),
        })?;
        let shard = trainflow_config::ModelShardId::from_parallelism_rank(
            src_model.clone(),
            src_topo,
            head,
        );
        let worker = *placement.get(&shard).ok_or_else(|| Error::Internal {
            message: format!("no placement for `{shard}`"),
        })?;
        let _ = routing.insert(HandlerId::Data(dp), worker);
        let _ = data_workers.insert(dp, worker);
    }

    // Partition the epoch contiguously over the data workers.
    let n_dp = src_topo.data;
    let per_dp = options.epoch_seqlens.len() / n_dp;
    let (stream, endpoints) = LocalStream::new(routing);

    let log = Rc::new(RefCell::new(FleetLog::default()));
    let card = ModelConfig {
        n_layers: 4,
        hidden_dim: 64,
        intermediate_dim: 256,
        vocab_size: 1024,
    };

    let mut tasks = Vec::new();
    for (worker, endpoint) in endpoints {
        let mut cursors = HashMap::new();
        for (&dp, &w) in &data_workers {
            if w == worker {
                let start = dp * per_dp;
                let _ = cursors.insert(
                    dp,
                    DataCursor {
                        seqlens: options.epoch_seqlens[start..start + per_dp].to_vec(),
                        pos: 0,
                        epoch: 0,
                    },
                );
            }
        }
        let state = WorkerState {
            log: log.clone(),
            rpc_outputs: rpc_outputs.clone(),
            cursors,
            options: options.clone(),
            card: card.clone(),
        };
        tasks.push(tokio::task::spawn_local(worker_main(endpoint, state)));
    }

    Ok((stream, SimFleet { log, _tasks: tasks }))
}

async fn worker_main(mut endpoint: WorkerEndpoint, mut state: WorkerState) {
    let worker = endpoint.worker_id();
    loop {
        let Ok(request) = endpoint.accept().await else {
            break;
        };
        state.log.borrow_mut().accepts.push((worker, request.handle_name));
        record_hooks(worker, &state, &request);

        let reply = handle(worker, &mut state, &request);
        if endpoint.reply(&request, reply).is_err() {
            break;
        }
    }
}

fn record_hooks(worker: WorkerId, state: &WorkerState, request: &Payload) {
    let mut log = state.log.borrow_mut();
    for hook in request.pre_hooks.iter().chain(&request.post_hooks) {
        log.hooks.push(HookRecord {
            worker,
            carrier: request.handle_name,
            hook: hook.id(),
        });
        // The dp-0 head of the target records the transfer, once per group.
        if let HookCall::DataTransfer(transfer) = hook {
            if let HandlerId::Shard(shard) = &request.handler {
                if shard.model_name == transfer.target
                    && shard.is_dp_head()
                    && shard.dp_rank() == Some(0)
                {
                    log.transfers.push(TransferRecord {
                        rpc: transfer.rpc_name.clone(),
                        producers: transfer
                            .producer_mappings
                            .iter()
                            .map(|m| (m.key.clone(), m.producer.clone()))
                            .collect(),
                        slice_sizes: transfer
                            .target_mapping
                            .iter()
                            .map(Vec::len)
                            .collect(),
                    });
                }
            }
        }
    }
}

fn handle(worker: WorkerId, state: &mut WorkerState, request: &Payload) -> PayloadData {
    match request.handle_name {
        HandleKind::Spec => PayloadData::Spec(FinetuneSpec {
            batch_size_per_device: state.options.batch_size_per_device,
            steps_per_epoch: state.options.steps_per_epoch,
            total_train_epochs: 0,
            total_train_steps: 0,
        }),
        HandleKind::ModelConfig => PayloadData::ModelConfig(state.card.clone()),
        HandleKind::Fetch => fetch(state, &request.handler),
        HandleKind::Generate | HandleKind::Inference | HandleKind::TrainStep => {
            model_call(state, request)
        }
        HandleKind::Evaluate => PayloadData::Scalars(
            [("eval_loss".to_owned(), 1.0)].into_iter().collect(),
        ),
        HandleKind::Save => {
            if let PayloadData::SaveDir(dir) = &request.data {
                state.log.borrow_mut().saves.push((worker, dir.clone()));
            }
            PayloadData::Empty
        }
        HandleKind::ClearDataCache => {
            if let PayloadData::Indices(indices) = &request.data {
                state
                    .log
                    .borrow_mut()
                    .clears
                    .push((worker, indices.clone()));
            }
            PayloadData::Empty
        }
        HandleKind::Initialize
        | HandleKind::Store
        | HandleKind::Empty
        | HandleKind::Ack => PayloadData::Empty,
    }
}

fn fetch(state: &mut WorkerState, handler: &HandlerId) -> PayloadData {
    let HandlerId::Data(dp) = handler else {
        return PayloadData::Empty;
    };
    let chunk_size = state.options.chunk_size;
    let dataset_keys = state.options.dataset_keys.clone();
    let Some(cursor) = state.cursors.get_mut(dp) else {
        return PayloadData::Empty;
    };
    if cursor.pos >= cursor.seqlens.len() {
        cursor.pos = 0;
        cursor.epoch += 1;
    }
    let take = chunk_size.min(cursor.seqlens.len() - cursor.pos);
    let lens = cursor.seqlens[cursor.pos..cursor.pos + take].to_vec();
    cursor.pos += take;

    let total_tokens: usize = lens.iter().map(|&l| l as usize).sum();
    let mut sample = SeqSample::new();
    let _ = sample
        .entries
        .insert("input_lens".to_owned(), TensorData::Lens(lens));
    for (i, key) in dataset_keys.iter().enumerate() {
        let _ = sample.entries.insert(
            key.clone(),
            TensorData::Blob(BlobSpec::contiguous(
                DType::I32,
                1,
                (*dp as u64) << 32 | i as u64,
                total_tokens,
            )),
        );
    }
    PayloadData::DataBatch(Box::new(DataBatch {
        epoch: cursor.epoch,
        data: sample,
    }))
}

fn model_call(state: &WorkerState, request: &Payload) -> PayloadData {
    let Some(transfer) = request.pre_hooks.iter().find_map(|h| match h {
        HookCall::DataTransfer(t) => Some(t),
        _ => None,
    }) else {
        return PayloadData::Empty;
    };
    let HandlerId::Shard(shard) = &request.handler else {
        return PayloadData::Empty;
    };
    let Some(dp) = shard.dp_rank() else {
        return PayloadData::Empty;
    };

    let grow = if request.handle_name == HandleKind::Generate {
        state.options.gen_new_tokens
    } else {
        0
    };
    let positions = &transfer.target_mapping[dp];
    let buffer_indices: Vec<u64> = positions.iter().map(|&p| transfer.buffer_indices[p]).collect();
    let seqlens: Vec<u32> = positions.iter().map(|&p| transfer.seqlens[p] + grow).collect();
    let keys = state
        .rpc_outputs
        .get(&transfer.rpc_name)
        .cloned()
        .unwrap_or_default();
    let scalars = if request.handle_name == HandleKind::TrainStep {
        [("loss".to_owned(), 0.42)].into_iter().collect()
    } else {
        indexmap::IndexMap::new()
    };
    PayloadData::BatchReply {
        keys,
        seqlens,
        buffer_indices,
        scalars,
    }
}
