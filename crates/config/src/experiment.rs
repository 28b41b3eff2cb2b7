// SPDX-License-Identifier: Apache-2.0

//! Top-level experiment configuration.
//!
//! An experiment names its models, pins each to a parallelism topology,
//! places every shard on a worker process, and declares the dataflow graph
//! plus run controls (epochs, save/eval cadence, benchmark cutoff).

use crate::dfg::DataflowGraph;
use crate::error::Error;
use crate::model::{ModelName, ModelShardId, Topology};
use crate::rpc::{Hook, ModelRpc};
use crate::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// One model replica pinned to a topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDeployment {
    /// The model replica being deployed.
    pub name: ModelName,
    /// Its parallelism layout.
    pub topology: Topology,
}

/// One shard pinned to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardPlacement {
    /// The shard address.
    pub shard: ModelShardId,
    /// The worker process hosting it.
    pub worker: WorkerId,
}

/// A frequency control specification. A control armed with several
/// thresholds fires when *any* of them is exceeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreqSpec {
    /// Fire every this many epochs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u64>,
    /// Fire every this many global steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u64>,
    /// Fire once this much wall-clock time has passed.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub secs: Option<Duration>,
}

/// Run controls of the experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentControls {
    /// Total number of training epochs before normal completion.
    pub total_train_epochs: u64,
    /// Checkpoint cadence.
    #[serde(default)]
    pub save: FreqSpec,
    /// Evaluation cadence.
    #[serde(default)]
    pub eval: FreqSpec,
    /// Stop after this many global steps and report throughput, regardless of
    /// epoch progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_steps: Option<u64>,
}

fn default_buffer_capacity() -> usize {
    1_000_000
}

/// The full, serializable description of one experiment trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Experiment name (first path component under the save root).
    pub experiment_name: String,
    /// Trial name (second path component under the save root).
    pub trial_name: String,
    /// Every model replica and its topology.
    pub deployments: Vec<ModelDeployment>,
    /// Every shard's worker placement.
    pub placements: Vec<ShardPlacement>,
    /// The dataflow graph's RPCs.
    pub rpcs: Vec<ModelRpc>,
    /// Replica pairs kept in sync through parameter reallocation, as
    /// (canonical sender, receiver).
    #[serde(default)]
    pub sync_param_pairs: Vec<(ModelName, ModelName)>,
    /// Run controls.
    pub controls: ExperimentControls,
    /// Advisory capacity of the sequence buffer.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Root directory for checkpoints. Workers write
    /// `<root>/<experiment>/<trial>/<role>/epoch{E}epochstep{S}globalstep{G}`.
    pub model_save_root: PathBuf,
}

/// Record of a batch-size floor applied at init.
///
/// An RPC cannot run with fewer sequences than its model has data-parallel
/// slices times pipeline stages, so undersized minimums are raised and the
/// promotion reported for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSizePromotion {
    /// The promoted RPC.
    pub rpc: crate::RpcName,
    /// The configured minimum.
    pub from: usize,
    /// The enforced minimum (dp size times pp size).
    pub to: usize,
}

impl ExperimentConfig {
    /// The topology of `model`, if deployed.
    #[must_use]
    pub fn topology(&self, model: &ModelName) -> Option<Topology> {
        self.deployments
            .iter()
            .find(|d| &d.name == model)
            .map(|d| d.topology)
    }

    /// The shard→worker map, as declared. Use [`Self::validate`] first; this
    /// accessor does not check exhaustiveness.
    #[must_use]
    pub fn placement_map(&self) -> HashMap<ModelShardId, WorkerId> {
        self.placements
            .iter()
            .map(|p| (p.shard.clone(), p.worker))
            .collect()
    }

    /// Raises every RPC's `min_n_seqs` to at least `dp * pp` of its model and
    /// returns the promotions applied, for the caller to log.
    pub fn promote_batch_floors(&mut self) -> Vec<BatchSizePromotion> {
        let mut promotions = Vec::new();
        for rpc in &mut self.rpcs {
            let Some(topo) = self
                .deployments
                .iter()
                .find(|d| d.name == rpc.model_name)
                .map(|d| d.topology)
            else {
                continue;
            };
            let floor = topo.data * topo.pipe;
            if rpc.min_n_seqs < floor {
                promotions.push(BatchSizePromotion {
                    rpc: rpc.name.clone(),
                    from: rpc.min_n_seqs,
                    to: floor,
                });
                rpc.min_n_seqs = floor;
                rpc.min_n_seqs_per_dp = 1;
            }
        }
        promotions
    }

    /// Validates the whole experiment and returns its dataflow graph.
    ///
    /// Checks, beyond [`DataflowGraph::build`]: every referenced model is
    /// deployed with a non-degenerate topology, every shard of every
    /// deployment is placed exactly once, and every producer override points
    /// at a model that can actually supply the key.
    pub fn validate(&self) -> Result<DataflowGraph, Error> {
        let graph = DataflowGraph::build(self.rpcs.clone())?;
        let mut errors = Vec::new();

        for d in &self.deployments {
            if d.topology.world_size() == 0 {
                errors.push(Error::DegenerateTopology {
                    model: d.name.clone(),
                });
            }
        }

        for rpc in graph.rpcs() {
            if self.topology(&rpc.model_name).is_none() {
                errors.push(Error::UnknownModel {
                    model: rpc.model_name.clone(),
                    referrer: format!("RPC `{}`", rpc.name),
                });
            }
            for hook in rpc.pre_hooks.iter().chain(&rpc.post_hooks) {
                if let Hook::SyncParam { source, target } = hook {
                    for endpoint in [source, target].into_iter().flatten() {
                        if self.topology(endpoint).is_none() {
                            errors.push(Error::UnknownModel {
                                model: endpoint.clone(),
                                referrer: format!("sync hook of RPC `{}`", rpc.name),
                            });
                        }
                    }
                }
            }
        }

        let src_models: Vec<&ModelName> = graph
            .sources()
            .map(|i| &graph.rpc(i).model_name)
            .collect();
        for rpc in graph.rpcs() {
            for (key, producer) in &rpc.data_producers {
                if self.topology(producer).is_none() {
                    errors.push(Error::UnknownModel {
                        model: producer.clone(),
                        referrer: format!("data producer of `{}` in RPC `{}`", key, rpc.name),
                    });
                    continue;
                }
                let produced_by_rpc = graph
                    .rpcs()
                    .iter()
                    .any(|r| r.model_name == *producer && r.produces(key));
                let is_dataset_owner = src_models.contains(&producer);
                if !produced_by_rpc && !is_dataset_owner {
                    errors.push(Error::UnproducibleKey {
                        rpc: rpc.name.clone(),
                        key: key.clone(),
                        producer: producer.clone(),
                    });
                }
            }
        }

        let placement = self.placement_map();
        for d in &self.deployments {
            for rank in 0..d.topology.world_size() {
                let shard =
                    ModelShardId::from_parallelism_rank(d.name.clone(), d.topology, rank);
                if !placement.contains_key(&shard) {
                    errors.push(Error::MissingPlacement { shard });
                }
            }
        }
        let mut seen = HashMap::new();
        for p in &self.placements {
            if seen.insert(p.shard.clone(), p.worker).is_some() {
                errors.push(Error::DuplicatePlacement {
                    shard: p.shard.clone(),
                });
            }
        }

        if errors.len() == 1 {
            return Err(errors.remove(0));
        }
        if !errors.is_empty() {
            return Err(Error::InvalidConfiguration { errors });
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ModelInterfaceType;
    use indexmap::IndexMap;

    fn rpc(name: &'static str, model: &'static str, inputs: &[&str], outputs: &[&str]) -> ModelRpc {
        ModelRpc {
            name: name.into(),
            model_name: ModelName::new(model, 0),
            interface_type: ModelInterfaceType::Inference,
            input_keys: inputs.iter().map(|k| (*k).to_owned().into()).collect(),
            output_keys: outputs.iter().map(|k| (*k).to_owned().into()).collect(),
            input_key_remap: IndexMap::new(),
            output_key_remap: IndexMap::new(),
            min_n_seqs: 1,
            max_n_seqs: 16,
            min_n_seqs_per_dp: 1,
            balanced_dp: false,
            max_concurrent_calls: 1,
            log_return_value: false,
            data_producers: IndexMap::new(),
            pre_hooks: vec![],
            post_hooks: vec![],
        }
    }

    fn experiment() -> ExperimentConfig {
        let actor = ModelName::new("actor", 0);
        let topo = Topology::new(1, 1, 2);
        let placements = (0..topo.world_size())
            .map(|rank| ShardPlacement {
                shard: ModelShardId::from_parallelism_rank(actor.clone(), topo, rank),
                worker: rank,
            })
            .collect();
        ExperimentConfig {
            experiment_name: "ppo".into(),
            trial_name: "trial0".into(),
            deployments: vec![ModelDeployment {
                name: actor,
                topology: topo,
            }],
            placements,
            rpcs: vec![
                rpc("gen", "actor", &["prompts"], &["seq"]),
                rpc("train", "actor", &["seq"], &[]),
            ],
            sync_param_pairs: vec![],
            controls: ExperimentControls {
                total_train_epochs: 1,
                save: FreqSpec::default(),
                eval: FreqSpec::default(),
                benchmark_steps: None,
            },
            buffer_capacity: default_buffer_capacity(),
            model_save_root: "/tmp/models".into(),
        }
    }

    #[test]
    fn valid_experiment_compiles() {
        let exp = experiment();
        let graph = exp.validate().expect("valid experiment");
        assert_eq!(graph.rpcs().len(), 2);
    }

    #[test]
    fn missing_placement_rejected() {
        let mut exp = experiment();
        let _ = exp.placements.pop();
        let err = exp.validate().expect_err("unplaced shard");
        assert!(matches!(err, Error::MissingPlacement { .. }));
    }

    #[test]
    fn batch_floor_promotion() {
        let mut exp = experiment();
        exp.rpcs[1].min_n_seqs = 1;
        let promotions = exp.promote_batch_floors();
        // dp * pp == 2 for the deployed topology.
        assert_eq!(
            promotions,
            vec![
                BatchSizePromotion {
                    rpc: "gen".into(),
                    from: 1,
                    to: 2
                },
                BatchSizePromotion {
                    rpc: "train".into(),
                    from: 1,
                    to: 2
                }
            ]
        );
        assert!(exp.rpcs.iter().all(|r| r.min_n_seqs == 2));
    }

    #[test]
    fn freq_spec_parses_durations() {
        let spec: FreqSpec = serde_json::from_value(serde_json::json!({
            "steps": 10,
            "secs": "5m",
        }))
        .expect("valid freq spec");
        assert_eq!(spec.steps, Some(10));
        assert_eq!(spec.secs, Some(Duration::from_secs(300)));
    }
}
