// SPDX-License-Identifier: Apache-2.0

//! The master driver.
//!
//! Owns the whole run: init rendezvous with the fleet, spawning the
//! scheduler coroutines, the step loop, save/eval cadence, benchmark and
//! epoch exits, and the per-step `clear_data_cache` broadcast.
//!
//! The step loop is a `select` over the terminal-RPC counter channel and the
//! coroutine error channel; an error raised by any coroutine aborts the run
//! after a clean teardown, and normal completion (epochs or benchmark) tears
//! the task set down the same way.

use crate::buffer::SequenceBuffer;
use crate::context::MasterContext;
use crate::control::{CoroutineControl, Inflight, RpcControl};
use crate::coroutines;
use crate::error::Error;
use crate::freq::FreqCtl;
use crate::hooks;
use crate::registry::DataOwner;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trainflow_config::{ExperimentConfig, ExperimentControls, ModelShardId, RpcName};
use trainflow_data::FinetuneSpec;
use trainflow_stream::{
    HandleKind, HandlerId, Payload, PayloadData, RequestClient, RequestId, gather_replies,
    request_all, round_trip,
};

/// Why a run ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Every configured training epoch completed.
    EpochsComplete,
    /// The benchmark step budget was reached.
    BenchmarkComplete,
}

/// The outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Why the run ended.
    pub reason: CompletionReason,
    /// Epochs entered.
    pub epochs: u64,
    /// Global steps completed.
    pub global_steps: u64,
    /// Wall-clock time of the whole run.
    pub total_time: Duration,
    /// Completed traversals per RPC at exit.
    pub traversals: HashMap<RpcName, u64>,
}

/// The master coordinator of one experiment trial.
pub struct MasterDriver<C: RequestClient + 'static> {
    ctx: Rc<MasterContext>,
    stream: Rc<C>,
    controls: ExperimentControls,
    buffer_capacity: usize,
}

impl<C: RequestClient + 'static> MasterDriver<C> {
    /// Validates the experiment and prepares a driver over `stream`.
    ///
    /// Undersized per-RPC batch minimums are promoted to the model's
    /// `dp * pp` floor, with a warning per promotion.
    pub fn new(mut config: ExperimentConfig, stream: C) -> Result<Self, Error> {
        for promotion in config.promote_batch_floors() {
            tracing::warn!(
                rpc = %promotion.rpc,
                from = promotion.from,
                to = promotion.to,
                "min_n_seqs below dp*pp; promoted"
            );
        }
        let graph = config.validate()?;
        let ctx = MasterContext::from_config(&config, graph)?;
        Ok(Self {
            ctx,
            stream: Rc::new(stream),
            controls: config.controls.clone(),
            buffer_capacity: config.buffer_capacity,
        })
    }

    /// Runs the experiment to completion.
    ///
    /// Must be called from within a `tokio::task::LocalSet` on a
    /// current-thread runtime; every coroutine is spawned `!Send`.
    pub async fn run(self) -> Result<RunSummary, Error> {
        let ft_spec = self.initialize().await?;
        tracing::info!(
            total_train_steps = ft_spec.total_train_steps,
            steps_per_epoch = ft_spec.steps_per_epoch,
            "initialize complete"
        );

        let n_dsts = self.ctx.graph.terminals().count();
        let stop = CancellationToken::new();
        let (train_tx, mut train_rx) = mpsc::channel(n_dsts.max(1));
        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let (master_tx, mut master_rx) = mpsc::channel(1);
        let (eval_tx, eval_rx) = mpsc::channel(1);
        let (save_tx, save_rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Error>();

        // Per-RPC controls plus the receive halves of the mailboxes, which
        // move into the reply coroutines below.
        let mut rpcs = HashMap::new();
        let mut mailbox_rxs: HashMap<RpcName, Vec<mpsc::Receiver<Inflight>>> = HashMap::new();
        for rpc in self.ctx.graph.rpcs() {
            let mut senders = Vec::with_capacity(rpc.max_concurrent_calls);
            let mut receivers = Vec::with_capacity(rpc.max_concurrent_calls);
            for _ in 0..rpc.max_concurrent_calls {
                let (tx, rx) = mpsc::channel(1);
                senders.push(tx);
                receivers.push(rx);
            }
            let _ = rpcs.insert(
                rpc.name.clone(),
                RpcControl {
                    semaphore: Rc::new(Semaphore::new(rpc.max_concurrent_calls)),
                    traversal: Cell::new(0),
                    mailboxes: senders,
                },
            );
            let _ = mailbox_rxs.insert(rpc.name.clone(), receivers);
        }
        let ctrl = Rc::new(CoroutineControl {
            stop: stop.clone(),
            train_count: train_tx,
            rpcs,
            training_buffer_indices: RefCell::new(BTreeSet::new()),
            data_amount: RefCell::new(crate::stats::InterfaceDataAmount::default()),
        });

        let buffer = SequenceBuffer::new(
            self.ctx.graph.rpcs().iter().map(|r| r.name.clone()).collect(),
            self.buffer_capacity,
            fetch_tx,
            master_tx,
        );
        let owners = DataOwner::new();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        macro_rules! spawn_coroutine {
            ($fut:expr) => {{
                let err_tx = err_tx.clone();
                let fut = $fut;
                handles.push(tokio::task::spawn_local(async move {
                    if let Err(e) = fut.await {
                        let _ = err_tx.send(e);
                    }
                }));
            }};
        }

        for rpc_idx in 0..self.ctx.graph.rpcs().len() {
            let name = self.ctx.graph.rpc(rpc_idx).name.clone();
            spawn_coroutine!(coroutines::rpc_request_loop(
                self.ctx.clone(),
                self.stream.clone(),
                buffer.clone(),
                owners.clone(),
                ctrl.clone(),
                rpc_idx,
            ));
            let receivers = mailbox_rxs
                .remove(&name)
                .unwrap_or_else(|| unreachable!("mailboxes registered above"));
            for mailbox in receivers {
                spawn_coroutine!(coroutines::rpc_reply_loop(
                    self.ctx.clone(),
                    self.stream.clone(),
                    buffer.clone(),
                    ctrl.clone(),
                    rpc_idx,
                    mailbox,
                ));
            }
        }
        spawn_coroutine!(coroutines::load_data_loop(
            self.ctx.clone(),
            self.stream.clone(),
            buffer.clone(),
            owners.clone(),
            ctrl.clone(),
            fetch_rx,
        ));
        spawn_coroutine!(coroutines::eval_loop(
            self.ctx.clone(),
            self.stream.clone(),
            ctrl.clone(),
            eval_rx,
        ));
        spawn_coroutine!(coroutines::save_loop(
            self.ctx.clone(),
            self.stream.clone(),
            ctrl.clone(),
            save_rx,
        ));
        tracing::info!(tasks = handles.len(), "scheduler coroutines spawned");

        let mut epoch: u64 = 0;
        let mut global_step: u64 = 0;
        let train_start = Instant::now();

        let outcome: Result<CompletionReason, Error> = {
            let ctx = &self.ctx;
            let ctrl = &ctrl;
            let stream = &self.stream;
            let controls = &self.controls;
            let epoch = &mut epoch;
            let global_step = &mut global_step;
            async move {
                let mut save_ctl = FreqCtl::new(&controls.save);
                let mut eval_ctl = FreqCtl::new(&controls.eval);
                let mut epoch_step: u64 = 0;
                let mut clear_request_ids: Option<Vec<RequestId>> = None;
                let n_workers = ctx.mwid2msids.len().max(1);

                loop {
                    let exec_start = Instant::now();
                    let mut dst_count = 0usize;
                    while dst_count < n_dsts {
                        tokio::select! {
                            biased;
                            Some(err) = err_rx.recv() => return Err(err),
                            fired = train_rx.recv() => {
                                if fired.is_none() {
                                    return Err(Error::Internal {
                                        message: "terminal counter closed".to_owned(),
                                    });
                                }
                                dst_count += 1;
                            }
                        }
                    }

                    let is_new_epoch = master_rx.try_recv().is_ok();
                    let should_eval = eval_ctl.check(u64::from(is_new_epoch), 1);
                    let should_save = save_ctl.check(u64::from(is_new_epoch), 1);
                    if is_new_epoch {
                        *epoch += 1;
                        epoch_step = 0;
                    }
                    epoch_step += 1;
                    *global_step += 1;

                    if should_eval {
                        let _ = eval_tx.try_send((*epoch, epoch_step));
                    }
                    if should_save {
                        let _ = save_tx.try_send((*epoch, epoch_step, *global_step));
                    }

                    if is_new_epoch && *epoch > controls.total_train_epochs {
                        return Ok(CompletionReason::EpochsComplete);
                    }

                    let e2e = exec_start.elapsed();
                    let stats = {
                        let mut amount = ctrl.data_amount.borrow_mut();
                        let stats = amount.summarize();
                        amount.clear();
                        stats
                    };
                    let tflops_rate = stats.tflops / e2e.as_secs_f64().max(1e-9);
                    tracing::info!(
                        epoch = *epoch,
                        epoch_step,
                        global_step = *global_step,
                        e2e_ms = e2e.as_millis() as u64,
                        n_seqs = stats.n_seqs,
                        n_tokens = stats.n_tokens,
                        tflops = format!("{tflops_rate:.2}"),
                        tflops_per_worker = format!("{:.2}", tflops_rate / n_workers as f64),
                        "step finished"
                    );

                    if controls
                        .benchmark_steps
                        .is_some_and(|steps| *global_step >= steps)
                    {
                        tracing::info!(
                            benchmark_steps = controls.benchmark_steps,
                            total_ms = train_start.elapsed().as_millis() as u64,
                            "benchmark complete"
                        );
                        return Ok(CompletionReason::BenchmarkComplete);
                    }

                    // At most one outstanding cache clear: await last step's
                    // acks before broadcasting this step's.
                    if let Some(previous) = clear_request_ids.take() {
                        tokio::select! {
                            biased;
                            Some(err) = err_rx.recv() => return Err(err),
                            acks = gather_replies(&**stream, &previous) => { let _ = acks?; }
                        }
                    }
                    let indices: Vec<u64> = {
                        let mut held = ctrl.training_buffer_indices.borrow_mut();
                        let drained = held.iter().copied().collect();
                        held.clear();
                        drained
                    };
                    let clears = ctx
                        .mwid2msids
                        .values()
                        .map(|shards| {
                            Payload::new(
                                HandlerId::shard(shards[0].clone()),
                                HandleKind::ClearDataCache,
                                PayloadData::Indices(indices.clone()),
                            )
                        })
                        .collect();
                    let ids = tokio::select! {
                        biased;
                        Some(err) = err_rx.recv() => return Err(err),
                        ids = request_all(&**stream, clears) => ids?,
                    };
                    clear_request_ids = Some(ids);
                }
            }
            .await
        };

        stop.cancel();
        for handle in handles {
            let _ = handle.await;
        }

        let reason = outcome?;
        Ok(RunSummary {
            reason,
            epochs: epoch,
            global_steps: global_step,
            total_time: train_start.elapsed(),
            traversals: ctrl
                .rpcs
                .iter()
                .map(|(name, rpc)| (name.clone(), rpc.traversal.get()))
                .collect(),
        })
    }

    /// Rendezvous with the fleet.
    ///
    /// Fetches the finetune spec from data worker 0 and each model's
    /// architecture card, then initializes every model; replicas other than 0
    /// exercise parameter reallocation from their canonical counterpart and
    /// back again, so both transfer directions are proven before training.
    async fn initialize(&self) -> Result<FinetuneSpec, Error> {
        let reply = round_trip(
            &*self.stream,
            vec![Payload::new(
                HandlerId::Data(0),
                HandleKind::Spec,
                PayloadData::Empty,
            )],
        )
        .await?
        .pop()
        .ok_or_else(|| Error::Internal {
            message: "spec request returned no reply".to_owned(),
        })?;
        let mut ft_spec = match reply.data {
            PayloadData::Spec(spec) => spec,
            _ => {
                return Err(Error::ProtocolViolation {
                    handler: reply.handler.to_string(),
                    expected: "Spec",
                });
            }
        };
        ft_spec.total_train_epochs = self.controls.total_train_epochs;
        ft_spec.total_train_steps = ft_spec.total_train_epochs * ft_spec.steps_per_epoch;

        for (model, topo) in &self.ctx.models {
            let shard = ModelShardId::from_parallelism_rank(model.clone(), *topo, 0);
            let reply = round_trip(
                &*self.stream,
                vec![Payload::new(
                    HandlerId::Shard(Box::new(shard)),
                    HandleKind::ModelConfig,
                    PayloadData::Empty,
                )],
            )
            .await?
            .pop()
            .ok_or_else(|| Error::Internal {
                message: format!("model_config of `{model}` returned no reply"),
            })?;
            match reply.data {
                PayloadData::ModelConfig(config) => {
                    let _ = self
                        .ctx
                        .model_configs
                        .borrow_mut()
                        .insert(model.clone(), config);
                }
                _ => {
                    return Err(Error::ProtocolViolation {
                        handler: reply.handler.to_string(),
                        expected: "ModelConfig",
                    });
                }
            }
        }

        for (model, _) in &self.ctx.models {
            let canonical = if model.replica_id > 0 {
                let sender = self
                    .ctx
                    .sync_param_pairs
                    .iter()
                    .find(|(_, receiver)| receiver == model)
                    .map(|(sender, _)| sender.clone())
                    .ok_or_else(|| Error::MissingSyncPair {
                        model: model.clone(),
                    })?;
                hooks::request_parameter_sync(&self.ctx, &*self.stream, &sender, model).await?;
                Some(sender)
            } else {
                None
            };

            let payloads = self
                .ctx
                .handlers_of(model)?
                .into_iter()
                .map(|h| {
                    Payload::new(
                        HandlerId::shard(h),
                        HandleKind::Initialize,
                        PayloadData::Spec(ft_spec),
                    )
                })
                .collect();
            let _ = round_trip(&*self.stream, payloads).await?;

            if let Some(sender) = canonical {
                hooks::request_parameter_sync(&self.ctx, &*self.stream, model, &sender).await?;
            }
        }
        Ok(ft_spec)
    }
}
