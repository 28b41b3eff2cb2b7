// SPDX-License-Identifier: Apache-2.0

//! The scheduler coroutines.
//!
//! Per RPC: one request loop and `max_concurrent_calls` reply loops, coupled
//! through size-1 mailboxes used round-robin. Alongside them: the
//! data-loading loop feeding the sequence buffer, and the eval and save
//! loops serving the driver's command queues.
//!
//! There is no explicit topological ordering anywhere. An RPC fires as soon
//! as the buffer holds enough ready records; readiness is exactly "every
//! producer completed for this record", so DFG order falls out of the buffer
//! semantics.

use crate::buffer::{Batch, RpcDemand, SequenceBuffer};
use crate::context::MasterContext;
use crate::control::{CoroutineControl, Inflight};
use crate::error::Error;
use crate::hooks::attach_rpc_hooks;
use crate::registry::DataOwner;
use crate::stats::CallRecord;
use indexmap::IndexMap;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use trainflow_config::{
    DataKey, ModelInterfaceType, ModelName, ModelRpc, ModelShardId, WorkerId,
};
use trainflow_data::{DataBatch, min_abs_diff_partition};
use trainflow_stream::{
    DataTransferSpec, HandleKind, HandlerId, HookCall, Payload, PayloadData, ProducerMapping,
    ReplyPattern, RequestClient, RequestId, awaitable_response, round_trip,
};

/// Pause between child-lag probes in the request loop's back-pressure wait.
const BACKPRESSURE_PROBE: Duration = Duration::from_millis(100);

fn expect_data_batch(payload: Payload) -> Result<DataBatch, Error> {
    match payload.data {
        PayloadData::DataBatch(batch) => Ok(*batch),
        _ => Err(Error::ProtocolViolation {
            handler: payload.handler.to_string(),
            expected: "DataBatch",
        }),
    }
}

struct BatchReplyView<'a> {
    keys: &'a [DataKey],
    seqlens: &'a [u32],
    buffer_indices: &'a [u64],
    scalars: &'a IndexMap<String, f64>,
}

fn expect_batch_reply(payload: &Payload) -> Result<BatchReplyView<'_>, Error> {
    match &payload.data {
        PayloadData::BatchReply {
            keys,
            seqlens,
            buffer_indices,
            scalars,
        } => Ok(BatchReplyView {
            keys,
            seqlens,
            buffer_indices,
            scalars,
        }),
        _ => Err(Error::ProtocolViolation {
            handler: payload.handler.to_string(),
            expected: "BatchReply",
        }),
    }
}

/// The request loop of one RPC.
///
/// Acquire the concurrency slot, hold back while any DFG child lags a full
/// batch behind, take a ready batch from the buffer, partition it over the
/// model's dp slices, record data ownership, resolve producer mappings, post
/// the collective request group, and hand the in-flight ids to the next
/// reply loop.
pub(crate) async fn rpc_request_loop<C: RequestClient>(
    ctx: Rc<MasterContext>,
    stream: Rc<C>,
    buffer: SequenceBuffer,
    owners: DataOwner,
    ctrl: Rc<CoroutineControl>,
    rpc_idx: usize,
) -> Result<(), Error> {
    let rpc = ctx.graph.rpc(rpc_idx).clone();
    let topo = ctx.topology(&rpc.model_name)?;
    let handlers = ctx.handlers_of(&rpc.model_name)?;
    let dp_size = topo.data;
    let is_src = ctx.graph.is_src(rpc_idx);

    let demand = RpcDemand {
        name: rpc.name.clone(),
        input_keys: rpc.input_keys.clone(),
        min_n_seqs: rpc.min_n_seqs,
        max_n_seqs: rpc.max_n_seqs,
        min_n_seqs_per_dp: rpc.min_n_seqs_per_dp,
        balanced_dp: rpc.balanced_dp,
        dp_size,
        is_src,
    };

    // Which model's dp layout owns each input key.
    let mut producer_names: IndexMap<DataKey, ModelName> = IndexMap::new();
    for key in &rpc.input_keys {
        let producer = rpc
            .data_producers
            .get(key)
            .cloned()
            .unwrap_or_else(|| ctx.src_model.clone());
        let _ = producer_names.insert(key.clone(), producer);
    }
    let mut producer_handlers: IndexMap<ModelName, Vec<ModelShardId>> = IndexMap::new();
    for producer in producer_names.values() {
        if !producer_handlers.contains_key(producer) {
            let _ = producer_handlers.insert(producer.clone(), ctx.handlers_of(producer)?);
        }
    }

    let children: Vec<(trainflow_config::RpcName, u64)> = ctx
        .graph
        .children_of(rpc_idx)
        .iter()
        .map(|&c| {
            let child = ctx.graph.rpc(c);
            (child.name.clone(), child.max_n_seqs as u64)
        })
        .collect();

    let semaphore = ctrl.rpc(&rpc.name).semaphore.clone();
    let mailboxes = ctrl.rpc(&rpc.name).mailboxes.clone();

    let mut consumed: u64 = 0;
    let mut reply_idx = 0usize;
    'run: while !ctrl.stop.is_cancelled() {
        let permit = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            permit = semaphore.acquire() => permit.map_err(|_| Error::Internal {
                message: format!("semaphore of `{}` closed", rpc.name),
            })?,
        };
        permit.forget();

        // Back-pressure: never run more than one full batch ahead of any
        // descendant, or the buffer would grow without bound.
        loop {
            let lagging = children
                .iter()
                .any(|(child, max)| consumed >= (ctrl.traversal(child) + 1) * max);
            if !lagging {
                break;
            }
            tokio::select! {
                biased;
                _ = ctrl.stop.cancelled() => break 'run,
                _ = tokio::time::sleep(BACKPRESSURE_PROBE) => {}
            }
        }

        let batch = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            batch = buffer.get_batch_for_rpc(&demand) => batch?,
        };

        if is_src {
            ctrl.training_buffer_indices
                .borrow_mut()
                .extend(batch.indices.iter().copied());
        }
        record_data_amount(&ctx, &ctrl, &rpc, &batch);
        consumed += batch.len() as u64;

        // Near-equal token counts per dp slice.
        let min_size = if rpc.balanced_dp {
            batch.len() / dp_size
        } else {
            rpc.min_n_seqs_per_dp.max(1)
        };
        let weights: Vec<u64> = batch.seqlens.iter().map(|&l| u64::from(l)).collect();
        let partitions = min_abs_diff_partition(&weights, dp_size, min_size)?;
        let target_mapping: Vec<Vec<usize>> =
            partitions.iter().map(|&(s, e)| (s..e).collect()).collect();

        // Everything this RPC will produce becomes owned by its dp slices,
        // so downstream RPCs know where to fetch from.
        for (dp, &(start, end)) in partitions.iter().enumerate() {
            for pos in start..end {
                for key in rpc.produced_keys() {
                    owners.set(batch.indices[pos], key, &rpc.model_name, dp)?;
                }
            }
        }

        let producer_mappings =
            resolve_producer_mappings(&ctx, &owners, &rpc, &producer_names, &batch)?;

        let (request_ids, side_request_ids) = post_collective(
            &ctx,
            &*stream,
            &rpc,
            &handlers,
            &producer_handlers,
            producer_mappings,
            target_mapping,
            &batch,
        )
        .await?;

        let inflight = Inflight {
            request_ids,
            side_request_ids,
            started: Instant::now(),
        };
        tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            sent = mailboxes[reply_idx].send(inflight) => sent.map_err(|_| Error::Internal {
                message: format!("reply mailbox of `{}` closed", rpc.name),
            })?,
        }
        reply_idx = (reply_idx + 1) % mailboxes.len();
        tracing::debug!(rpc = %rpc.name, n_seqs = batch.len(), "requested");
    }
    Ok(())
}

fn record_data_amount(
    ctx: &MasterContext,
    ctrl: &CoroutineControl,
    rpc: &ModelRpc,
    batch: &Batch,
) {
    let record = CallRecord {
        config: ctx.model_config(&rpc.model_name),
        batch_size: batch.len(),
        seqlens: batch.seqlens.clone(),
    };
    let mut amount = ctrl.data_amount.borrow_mut();
    match rpc.interface_type {
        ModelInterfaceType::Generate => amount.generate.push(record),
        ModelInterfaceType::Inference => amount.inf.push(record),
        ModelInterfaceType::TrainStep => amount.train.push(record),
    }
}

/// Reads the owner registry for every (sequence, input key) pair of the batch
/// and folds it into per-producer dp position lists.
fn resolve_producer_mappings(
    ctx: &MasterContext,
    owners: &DataOwner,
    rpc: &ModelRpc,
    producer_names: &IndexMap<DataKey, ModelName>,
    batch: &Batch,
) -> Result<Vec<ProducerMapping>, Error> {
    let mut mappings = Vec::with_capacity(rpc.input_keys.len());
    for key in &rpc.input_keys {
        let expected = &producer_names[key];
        let producer_dp = ctx.topology(expected)?.data;
        let mut positions_per_dp: Vec<Vec<usize>> = vec![Vec::new(); producer_dp];
        let mut seen: Vec<ModelName> = Vec::new();

        for (pos, &index) in batch.indices.iter().enumerate() {
            let (owner, dp) = owners.get(index, key)?;
            if !seen.contains(&owner) {
                seen.push(owner.clone());
            }
            if dp >= producer_dp {
                return Err(Error::Internal {
                    message: format!(
                        "owner dp {dp} of key `{key}` exceeds dp size {producer_dp} of `{expected}`"
                    ),
                });
            }
            positions_per_dp[dp].push(pos);
        }

        if seen.len() != 1 {
            return Err(Error::AmbiguousOwner {
                rpc: rpc.name.clone(),
                key: key.clone(),
                owners: seen,
            });
        }
        if seen[0] != *expected {
            return Err(Error::Internal {
                message: format!(
                    "key `{key}` of `{}` is owned by `{}`, expected producer `{expected}`",
                    rpc.name, seen[0]
                ),
            });
        }

        mappings.push(ProducerMapping {
            producer: seen.remove(0),
            key: key.clone(),
            positions_per_dp,
        });
    }
    Ok(mappings)
}

/// Posts one collective request group: the RPC payload to every primary
/// handler, `empty` carriers to producing shards on workers not otherwise
/// addressed, hooks resolved on top, all wrapped in the ordering handshake.
async fn post_collective<C: RequestClient>(
    ctx: &MasterContext,
    stream: &C,
    rpc: &ModelRpc,
    handlers: &[ModelShardId],
    producer_handlers: &IndexMap<ModelName, Vec<ModelShardId>>,
    producer_mappings: Vec<ProducerMapping>,
    target_mapping: Vec<Vec<usize>>,
    batch: &Batch,
) -> Result<(Vec<RequestId>, Vec<RequestId>), Error> {
    let transfer = DataTransferSpec {
        rpc_name: rpc.name.clone(),
        handle_name: rpc.interface_type.into(),
        target: rpc.model_name.clone(),
        keys: rpc.input_keys.clone(),
        producer_mappings,
        target_mapping,
        input_key_remap: rpc.input_key_remap.clone(),
        output_key_remap: rpc.output_key_remap.clone(),
        buffer_indices: batch.indices.clone(),
        seqlens: batch.seqlens.clone(),
    };

    let mut payloads: IndexMap<ModelShardId, Payload> = IndexMap::new();
    let mut covered: Vec<WorkerId> = Vec::new();
    for handler in handlers {
        let worker = ctx.worker_of(handler)?;
        if covered.contains(&worker) {
            return Err(Error::WorkerCollision {
                rpc: rpc.name.clone(),
                worker,
            });
        }
        covered.push(worker);
        let mut payload = Payload::new(
            HandlerId::shard(handler.clone()),
            rpc.interface_type.into(),
            PayloadData::Empty,
        );
        payload.push_hook(HookCall::DataTransfer(Box::new(transfer.clone())), false);
        let _ = payloads.insert(handler.clone(), payload);
    }

    // Producing shards must run the transfer too, even when the RPC itself
    // does not address their worker.
    for producer_shards in producer_handlers.values() {
        for shard in producer_shards {
            let worker = ctx.worker_of(shard)?;
            if covered.contains(&worker) {
                continue;
            }
            covered.push(worker);
            let mut payload = Payload::new(
                HandlerId::shard(shard.clone()),
                HandleKind::Empty,
                PayloadData::Empty,
            );
            payload.push_hook(HookCall::DataTransfer(Box::new(transfer.clone())), false);
            let _ = payloads.insert(shard.clone(), payload);
        }
    }

    attach_rpc_hooks(ctx, rpc, &mut payloads, &mut covered, handlers, false)?;
    attach_rpc_hooks(ctx, rpc, &mut payloads, &mut covered, handlers, true)?;

    let mut request_ids = Vec::with_capacity(handlers.len());
    let mut side_request_ids = Vec::new();
    let mut syn_ids = Vec::with_capacity(payloads.len());
    let mut acks = Vec::with_capacity(payloads.len());
    for (shard, payload) in payloads {
        syn_ids.push(payload.syn_reply_id);
        acks.push(payload.ack());
        let is_primary = handlers.contains(&shard);
        let id = stream.post(payload)?;
        if is_primary {
            request_ids.push(id);
        } else {
            side_request_ids.push(id);
        }
    }

    let syn_patterns: Vec<ReplyPattern> = syn_ids
        .into_iter()
        .map(|id| ReplyPattern::exact([id]))
        .collect();
    let syn_waits = syn_patterns
        .iter()
        .map(|pattern| awaitable_response(stream, pattern));
    for outcome in futures::future::join_all(syn_waits).await {
        let _ = outcome?;
    }
    for ack in acks {
        let _ = stream.post(ack)?;
    }
    Ok((request_ids, side_request_ids))
}

/// One reply loop of one RPC.
///
/// Awaits side-participant replies first (so hook-only payloads are fully
/// drained), then the primary replies; keeps the dp-head replies, releases
/// the concurrency slot, bumps the traversal counter, and either completes a
/// step (terminal RPC) or amends the buffer with the produced keys.
pub(crate) async fn rpc_reply_loop<C: RequestClient>(
    ctx: Rc<MasterContext>,
    stream: Rc<C>,
    buffer: SequenceBuffer,
    ctrl: Rc<CoroutineControl>,
    rpc_idx: usize,
    mut mailbox: mpsc::Receiver<Inflight>,
) -> Result<(), Error> {
    let rpc = ctx.graph.rpc(rpc_idx).clone();
    let topo = ctx.topology(&rpc.model_name)?;
    let dp_head_ranks = topo.dp_head_ranks();
    let is_dst = ctx.graph.is_dst(rpc_idx);

    'run: while !ctrl.stop.is_cancelled() {
        let inflight = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            inflight = mailbox.recv() => match inflight {
                Some(inflight) => inflight,
                None => break 'run,
            },
        };

        tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            outcome = trainflow_stream::gather_replies(&*stream, &inflight.side_request_ids) => {
                let _ = outcome?;
            }
        }
        let responses = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            responses = trainflow_stream::gather_replies(&*stream, &inflight.request_ids) => responses?,
        };

        let heads: Vec<&Payload> = dp_head_ranks.iter().map(|&r| &responses[r]).collect();

        // Produced keys, remapped to their buffer-visible names.
        let first = expect_batch_reply(heads[0])?;
        let keys: Vec<DataKey> = first
            .keys
            .iter()
            .map(|k| rpc.output_key_remap.get(k).unwrap_or(k).clone())
            .collect();

        if rpc.log_return_value {
            let dicts: Vec<IndexMap<String, f64>> = heads
                .iter()
                .map(|h| expect_batch_reply(h).map(|r| r.scalars.clone()))
                .collect::<Result<_, _>>()?;
            let merged = trainflow_data::gather_scalars(&dicts);
            tracing::info!(rpc = %rpc.name, scalars = ?merged, "rpc returned");
        }

        ctrl.rpc(&rpc.name).semaphore.add_permits(1);
        let traversal = &ctrl.rpc(&rpc.name).traversal;
        traversal.set(traversal.get() + 1);

        if is_dst {
            tokio::select! {
                biased;
                _ = ctrl.stop.cancelled() => break 'run,
                sent = ctrl.train_count.send(()) => sent.map_err(|_| Error::Internal {
                    message: "terminal counter closed".to_owned(),
                })?,
            }
        } else {
            let mut indices = Vec::new();
            let mut seqlens = Vec::new();
            for head in &heads {
                let reply = expect_batch_reply(head)?;
                indices.extend_from_slice(reply.buffer_indices);
                seqlens.extend_from_slice(reply.seqlens);
            }
            let amendments = seqlens.iter().map(|&l| (keys.clone(), l)).collect();
            buffer.amend_batch(&indices, amendments)?;
        }

        tracing::debug!(
            rpc = %rpc.name,
            elapsed_ms = inflight.started.elapsed().as_millis() as u64,
            "finished"
        );
    }
    Ok(())
}

/// The data-loading loop.
///
/// On every fetch command: pulls dataset chunks from all data workers until
/// the loader's epoch counter bumps, inserts the sequences into the buffer,
/// records dataset-key ownership under the source model's dp layout, tells
/// the data workers which buffer indices their sequences got, and finally
/// wakes one buffer waiter per RPC.
pub(crate) async fn load_data_loop<C: RequestClient>(
    ctx: Rc<MasterContext>,
    stream: Rc<C>,
    buffer: SequenceBuffer,
    owners: DataOwner,
    ctrl: Rc<CoroutineControl>,
    mut fetch_rx: mpsc::Receiver<()>,
) -> Result<(), Error> {
    'run: while !ctrl.stop.is_cancelled() {
        tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            cmd = fetch_rx.recv() => match cmd {
                Some(()) => {}
                None => break 'run,
            },
        }

        tracing::info!("filling the sequence buffer for a new epoch");
        let started = Instant::now();
        let mut cur_epoch: Option<u64> = None;
        loop {
            let fetches = (0..ctx.src_dp_size)
                .map(|dp| Payload::new(HandlerId::Data(dp), HandleKind::Fetch, PayloadData::Empty))
                .collect();
            let replies = tokio::select! {
                biased;
                _ = ctrl.stop.cancelled() => break 'run,
                replies = round_trip(&*stream, fetches) => replies?,
            };
            let batches: Vec<DataBatch> = replies
                .into_iter()
                .map(expect_data_batch)
                .collect::<Result<_, _>>()?;
            let epoch = batches[0].epoch;

            let mut stores = Vec::with_capacity(batches.len());
            for (dp, batch) in batches.iter().enumerate() {
                let seqlens = batch.data.seqlens()?;
                let keys: Vec<DataKey> = batch
                    .data
                    .keys()
                    .map(|k| DataKey::from(k.to_owned()))
                    .collect();
                let records = seqlens.iter().map(|&l| (keys.clone(), l)).collect();
                let indices = buffer.put_batch(records)?;
                for &index in &indices {
                    for key in &keys {
                        owners.set(index, key, &ctx.src_model, dp)?;
                    }
                }
                stores.push(Payload::new(
                    HandlerId::Data(dp),
                    HandleKind::Store,
                    PayloadData::Indices(indices),
                ));
            }
            tokio::select! {
                biased;
                _ = ctrl.stop.cancelled() => break 'run,
                replies = round_trip(&*stream, stores) => { let _ = replies?; }
            }

            match cur_epoch {
                None => cur_epoch = Some(epoch),
                Some(first) if epoch != first => break,
                Some(_) => {}
            }
        }

        buffer.notify(ctx.graph.rpcs().len());
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "buffer filled"
        );
    }
    Ok(())
}

/// The evaluation loop: on command, runs a collective `evaluate` over every
/// model shard and logs the merged scalars.
pub(crate) async fn eval_loop<C: RequestClient>(
    ctx: Rc<MasterContext>,
    stream: Rc<C>,
    ctrl: Rc<CoroutineControl>,
    mut eval_rx: mpsc::Receiver<(u64, u64)>,
) -> Result<(), Error> {
    let handlers = ctx.all_model_handlers()?;
    'run: while !ctrl.stop.is_cancelled() {
        let (epoch, epoch_step) = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            cmd = eval_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break 'run,
            },
        };
        let payloads = handlers
            .iter()
            .map(|h| {
                Payload::new(
                    HandlerId::shard(h.clone()),
                    HandleKind::Evaluate,
                    PayloadData::Empty,
                )
            })
            .collect();
        let replies = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            replies = round_trip(&*stream, payloads) => replies?,
        };
        let dicts: Vec<IndexMap<String, f64>> = replies
            .into_iter()
            .filter_map(|p| match p.data {
                PayloadData::Scalars(scalars) => Some(scalars),
                _ => None,
            })
            .collect();
        let stats = trainflow_data::gather_scalars(&dicts);
        tracing::info!(epoch, epoch_step, stats = ?stats, "evaluation results");
    }
    Ok(())
}

/// The save loop: on command, asks replica-0 shards to checkpoint under
/// `<root>/<role>/epoch{E}epochstep{S}globalstep{G}`.
pub(crate) async fn save_loop<C: RequestClient>(
    ctx: Rc<MasterContext>,
    stream: Rc<C>,
    ctrl: Rc<CoroutineControl>,
    mut save_rx: mpsc::Receiver<(u64, u64, u64)>,
) -> Result<(), Error> {
    let handlers: Vec<ModelShardId> = ctx
        .all_model_handlers()?
        .into_iter()
        .filter(|h| h.model_name.replica_id == 0)
        .collect();
    'run: while !ctrl.stop.is_cancelled() {
        let (epoch, epoch_step, global_step) = tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            cmd = save_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break 'run,
            },
        };
        let payloads = handlers
            .iter()
            .map(|h| {
                let dir = ctx
                    .save_root
                    .join(h.model_name.role.as_ref())
                    .join(format!("epoch{epoch}epochstep{epoch_step}globalstep{global_step}"));
                Payload::new(
                    HandlerId::shard(h.clone()),
                    HandleKind::Save,
                    PayloadData::SaveDir(dir),
                )
            })
            .collect();
        tokio::select! {
            biased;
            _ = ctrl.stop.cancelled() => break 'run,
            replies = round_trip(&*stream, payloads) => { let _ = replies?; }
        }
        tracing::info!(epoch, epoch_step, "saved models");
    }
    Ok(())
}
