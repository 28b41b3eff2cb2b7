// SPDX-License-Identifier: Apache-2.0

//! Hook resolution.
//!
//! Parameter reallocation is a collective across two topologies: every worker
//! holding a shard of either endpoint has to step in lockstep, even when it
//! plays no other part in the RPC. The resolver therefore guarantees that
//! each *worker id* receives exactly one payload listing every hook it must
//! execute: primary handlers get hooks appended, side participants get a
//! dedicated `empty` carrier payload.

use crate::context::MasterContext;
use crate::error::Error;
use indexmap::IndexMap;
use std::collections::HashSet;
use trainflow_config::{Hook, ModelName, ModelRpc, ModelShardId, WorkerId};
use trainflow_stream::{
    HandleKind, HandlerId, HookCall, OffloadSpec, ParamReallocSpec, Payload, PayloadData,
    RequestClient, round_trip,
};

/// Assembles the realloc descriptor for a transfer from `from` to `to`.
fn realloc_spec(
    ctx: &MasterContext,
    from: &ModelName,
    to: &ModelName,
) -> Result<ParamReallocSpec, Error> {
    Ok(ParamReallocSpec {
        from_model_name: from.clone(),
        to_model_name: to.clone(),
        from_topo: ctx.topology(from)?,
        to_topo: ctx.topology(to)?,
        to_model_config: ctx.require_model_config(to)?,
    })
}

/// Attaches the RPC's pre- or post-hooks to the payload set.
///
/// `payloads` maps every already-addressed shard to its payload and
/// `covered_workers` tracks which worker ids those payloads reach. New side
/// participants extend both.
pub(crate) fn attach_rpc_hooks(
    ctx: &MasterContext,
    rpc: &ModelRpc,
    payloads: &mut IndexMap<ModelShardId, Payload>,
    covered_workers: &mut Vec<WorkerId>,
    main_handlers: &[ModelShardId],
    post: bool,
) -> Result<(), Error> {
    let mut main_workers = HashSet::new();
    for handler in main_handlers {
        let _ = main_workers.insert(ctx.worker_of(handler)?);
    }

    let hooks = if post { &rpc.post_hooks } else { &rpc.pre_hooks };
    for hook in hooks {
        match hook {
            Hook::SyncParam { source, target } => {
                // Exactly one side is named; the other is this RPC's model.
                let (from, to) = match (source, target) {
                    (None, Some(target)) => (rpc.model_name.clone(), target.clone()),
                    (Some(source), None) => (source.clone(), rpc.model_name.clone()),
                    _ => {
                        return Err(Error::Internal {
                            message: format!("RPC `{}` has an unresolved sync hook", rpc.name),
                        });
                    }
                };
                let other = if source.is_none() { to.clone() } else { from.clone() };
                let spec = realloc_spec(ctx, &from, &to)?;

                for handler in main_handlers {
                    if let Some(payload) = payloads.get_mut(handler) {
                        payload.push_hook(HookCall::ParamRealloc(Box::new(spec.clone())), post);
                    }
                }

                for handler in ctx.handlers_of(&other)? {
                    let worker = ctx.worker_of(&handler)?;
                    if !covered_workers.contains(&worker) {
                        let mut payload = Payload::new(
                            HandlerId::shard(handler.clone()),
                            HandleKind::Empty,
                            PayloadData::Empty,
                        );
                        payload.push_hook(HookCall::ParamRealloc(Box::new(spec.clone())), post);
                        let _ = payloads.insert(handler, payload);
                        covered_workers.push(worker);
                    } else if !main_workers.contains(&worker) {
                        // The worker already receives a payload for another
                        // purpose; piggy-back the hook on it.
                        let carrier = payloads
                            .iter_mut()
                            .find(|(shard, _)| {
                                ctx.msid2mwid.get(*shard).copied() == Some(worker)
                            })
                            .map(|(_, payload)| payload)
                            .ok_or_else(|| Error::Internal {
                                message: format!(
                                    "worker {worker} covered but carries no payload"
                                ),
                            })?;
                        carrier.push_hook(HookCall::ParamRealloc(Box::new(spec.clone())), post);
                    }
                }
            }
            Hook::Offload => {
                for handler in main_handlers {
                    if let Some(payload) = payloads.get_mut(handler) {
                        payload.push_hook(
                            HookCall::Offload(Box::new(OffloadSpec {
                                model_name: handler.model_name.clone(),
                            })),
                            post,
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Runs one standalone parameter reallocation from `from` to `to`, used at
/// init to exercise both transfer directions before training starts.
///
/// Handlers of `from` are prioritized: when both endpoints share a worker,
/// the payload is addressed at the `from` shard.
pub(crate) async fn request_parameter_sync<C: RequestClient>(
    ctx: &MasterContext,
    stream: &C,
    from: &ModelName,
    to: &ModelName,
) -> Result<(), Error> {
    let spec = realloc_spec(ctx, from, to)?;

    let mut handlers = ctx.handlers_of(from)?;
    let mut covered: HashSet<WorkerId> = HashSet::new();
    for handler in &handlers {
        let _ = covered.insert(ctx.worker_of(handler)?);
    }
    for handler in ctx.handlers_of(to)? {
        if covered.insert(ctx.worker_of(&handler)?) {
            handlers.push(handler);
        }
    }

    let payloads = handlers
        .into_iter()
        .map(|handler| {
            let mut payload = Payload::new(
                HandlerId::shard(handler),
                HandleKind::Empty,
                PayloadData::Empty,
            );
            payload.push_hook(HookCall::ParamRealloc(Box::new(spec.clone())), false);
            payload
        })
        .collect();
    let _ = round_trip(stream, payloads).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use trainflow_config::{
        DataflowGraph, ExperimentConfig, ExperimentControls, FreqSpec, ModelInterfaceType,
        Topology,
    };
    use trainflow_config::experiment::{ModelDeployment, ShardPlacement};

    fn shard(model: &ModelName, topo: Topology, rank: usize) -> ModelShardId {
        ModelShardId::from_parallelism_rank(model.clone(), topo, rank)
    }

    /// Model A (`actor@0`) on workers 0-1, model B (`actor@1`) on worker 2.
    fn context(rpcs: Vec<ModelRpc>) -> Rc<MasterContext> {
        let a = ModelName::new("actor", 0);
        let b = ModelName::new("actor", 1);
        let a_topo = Topology::new(1, 1, 2);
        let b_topo = Topology::new(1, 1, 1);
        let config = ExperimentConfig {
            experiment_name: "ppo".into(),
            trial_name: "t0".into(),
            deployments: vec![
                ModelDeployment {
                    name: a.clone(),
                    topology: a_topo,
                },
                ModelDeployment {
                    name: b.clone(),
                    topology: b_topo,
                },
            ],
            placements: vec![
                ShardPlacement {
                    shard: shard(&a, a_topo, 0),
                    worker: 0,
                },
                ShardPlacement {
                    shard: shard(&a, a_topo, 1),
                    worker: 1,
                },
                ShardPlacement {
                    shard: shard(&b, b_topo, 0),
                    worker: 2,
                },
            ],
            rpcs: rpcs.clone(),
            sync_param_pairs: vec![(a.clone(), b.clone())],
            controls: ExperimentControls {
                total_train_epochs: 1,
                save: FreqSpec::default(),
                eval: FreqSpec::default(),
                benchmark_steps: None,
            },
            buffer_capacity: 1024,
            model_save_root: "/tmp/models".into(),
        };
        let graph = DataflowGraph::build(rpcs).expect("valid graph");
        let ctx = MasterContext::from_config(&config, graph).expect("valid context");
        let card = trainflow_config::ModelConfig {
            n_layers: 2,
            hidden_dim: 8,
            intermediate_dim: 32,
            vocab_size: 64,
        };
        let _ = ctx.model_configs.borrow_mut().insert(a, card.clone());
        let _ = ctx.model_configs.borrow_mut().insert(b, card);
        ctx
    }

    fn train_rpc_with_sync_source(source: ModelName) -> ModelRpc {
        ModelRpc {
            name: "train".into(),
            model_name: ModelName::new("actor", 0),
            interface_type: ModelInterfaceType::TrainStep,
            input_keys: vec!["seq".into()],
            output_keys: vec![],
            input_key_remap: IndexMap::new(),
            output_key_remap: IndexMap::new(),
            min_n_seqs: 2,
            max_n_seqs: 4,
            min_n_seqs_per_dp: 1,
            balanced_dp: false,
            max_concurrent_calls: 1,
            log_return_value: false,
            data_producers: IndexMap::new(),
            pre_hooks: vec![Hook::SyncParam {
                source: Some(source),
                target: None,
            }],
            post_hooks: vec![Hook::Offload],
        }
    }

    #[test]
    fn side_participant_gets_one_empty_carrier() {
        let b = ModelName::new("actor", 1);
        let rpc = train_rpc_with_sync_source(b.clone());
        let ctx = context(vec![rpc.clone()]);
        let main_handlers = ctx.handlers_of(&rpc.model_name).expect("handlers");

        let mut payloads: IndexMap<ModelShardId, Payload> = main_handlers
            .iter()
            .map(|h| {
                (
                    h.clone(),
                    Payload::new(
                        HandlerId::shard(h.clone()),
                        HandleKind::TrainStep,
                        PayloadData::Empty,
                    ),
                )
            })
            .collect();
        let mut covered = vec![0, 1];

        attach_rpc_hooks(&ctx, &rpc, &mut payloads, &mut covered, &main_handlers, false)
            .expect("resolvable hooks");
        attach_rpc_hooks(&ctx, &rpc, &mut payloads, &mut covered, &main_handlers, true)
            .expect("resolvable hooks");

        // Worker 2 holds a shard of B only: exactly one extra payload, an
        // `empty` carrier with the realloc hook.
        assert_eq!(payloads.len(), 3);
        assert_eq!(covered, vec![0, 1, 2]);
        let b_topo = ctx.topology(&b).expect("topology");
        let carrier = &payloads[&shard(&b, b_topo, 0)];
        assert_eq!(carrier.handle_name, HandleKind::Empty);
        assert_eq!(carrier.pre_hooks.len(), 1);
        assert!(matches!(carrier.pre_hooks[0], HookCall::ParamRealloc(_)));

        // Primary handlers carry the realloc pre-hook and the offload
        // post-hook; the side participant is not offloaded.
        for handler in &main_handlers {
            let payload = &payloads[handler];
            assert!(matches!(payload.pre_hooks[0], HookCall::ParamRealloc(_)));
            assert!(matches!(payload.post_hooks[0], HookCall::Offload(_)));
        }
        assert!(carrier.post_hooks.is_empty());
    }

    #[test]
    fn already_addressed_worker_gets_hook_appended() {
        let b = ModelName::new("actor", 1);
        let rpc = train_rpc_with_sync_source(b.clone());
        let ctx = context(vec![rpc.clone()]);
        let main_handlers = ctx.handlers_of(&rpc.model_name).expect("handlers");
        let b_topo = ctx.topology(&b).expect("topology");
        let b_shard = shard(&b, b_topo, 0);

        // Worker 2 is already addressed by a producer-side carrier.
        let mut payloads: IndexMap<ModelShardId, Payload> = main_handlers
            .iter()
            .map(|h| {
                (
                    h.clone(),
                    Payload::new(
                        HandlerId::shard(h.clone()),
                        HandleKind::TrainStep,
                        PayloadData::Empty,
                    ),
                )
            })
            .collect();
        let _ = payloads.insert(
            b_shard.clone(),
            Payload::new(
                HandlerId::shard(b_shard.clone()),
                HandleKind::Empty,
                PayloadData::Empty,
            ),
        );
        let mut covered = vec![0, 1, 2];

        attach_rpc_hooks(&ctx, &rpc, &mut payloads, &mut covered, &main_handlers, false)
            .expect("resolvable hooks");

        // No new payload; the hook rides on the existing carrier.
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[&b_shard].pre_hooks.len(), 1);
    }
}
