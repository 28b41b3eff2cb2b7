// SPDX-License-Identifier: Apache-2.0

//! Process-scope master state: the validated graph, topologies, placements
//! and the architecture cards collected at init. Built once from the
//! experiment config and shared by reference with every coroutine.

use crate::error::Error;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;
use trainflow_config::{
    DataflowGraph, ExperimentConfig, ModelConfig, ModelName, ModelShardId, Topology, WorkerId,
};

/// Immutable (post-init) state shared by the driver and every coroutine.
pub struct MasterContext {
    /// The validated dataflow graph.
    pub graph: DataflowGraph,
    /// Deployed models with their topologies, in declaration order.
    pub models: Vec<(ModelName, Topology)>,
    /// Shard → worker placement.
    pub msid2mwid: HashMap<ModelShardId, WorkerId>,
    /// Worker → shards hosted there, workers in ascending order.
    pub mwid2msids: BTreeMap<WorkerId, Vec<ModelShardId>>,
    /// Replica sync pairs, as (canonical sender, receiver).
    pub sync_param_pairs: Vec<(ModelName, ModelName)>,
    /// Architecture cards reported by workers at init.
    pub model_configs: RefCell<HashMap<ModelName, ModelConfig>>,
    /// The model of the first source RPC; its data-parallel slices own the
    /// raw dataset keys.
    pub src_model: ModelName,
    /// Data-parallel size of the source model, which is also the number of
    /// data workers.
    pub src_dp_size: usize,
    /// `<save root>/<experiment>/<trial>`.
    pub save_root: PathBuf,

    topologies: HashMap<ModelName, Topology>,
}

impl MasterContext {
    /// Builds the context from a validated configuration and its graph.
    pub fn from_config(config: &ExperimentConfig, graph: DataflowGraph) -> Result<Rc<Self>, Error> {
        let models: Vec<(ModelName, Topology)> = config
            .deployments
            .iter()
            .map(|d| (d.name.clone(), d.topology))
            .collect();
        let topologies: HashMap<ModelName, Topology> = models.iter().cloned().collect();

        let msid2mwid = config.placement_map();
        let mut mwid2msids: BTreeMap<WorkerId, Vec<ModelShardId>> = BTreeMap::new();
        for placement in &config.placements {
            mwid2msids
                .entry(placement.worker)
                .or_default()
                .push(placement.shard.clone());
        }

        let src_rpc_index = graph.sources().next().ok_or_else(|| Error::Internal {
            message: "validated graph lost its source RPC".to_owned(),
        })?;
        let src_model = graph.rpc(src_rpc_index).model_name.clone();
        let src_dp_size = topologies
            .get(&src_model)
            .map(|t| t.data)
            .ok_or_else(|| Error::Internal {
                message: format!("no topology for source model `{src_model}`"),
            })?;

        Ok(Rc::new(Self {
            graph,
            models,
            msid2mwid,
            mwid2msids,
            sync_param_pairs: config.sync_param_pairs.clone(),
            model_configs: RefCell::new(HashMap::new()),
            src_model,
            src_dp_size,
            save_root: config
                .model_save_root
                .join(&config.experiment_name)
                .join(&config.trial_name),
            topologies,
        }))
    }

    /// The topology of `model`.
    pub fn topology(&self, model: &ModelName) -> Result<Topology, Error> {
        self.topologies
            .get(model)
            .copied()
            .ok_or_else(|| Error::Internal {
                message: format!("no topology for model `{model}`"),
            })
    }

    /// Every shard address of `model`, in parallelism-rank order.
    pub fn handlers_of(&self, model: &ModelName) -> Result<Vec<ModelShardId>, Error> {
        let topo = self.topology(model)?;
        Ok((0..topo.world_size())
            .map(|rank| ModelShardId::from_parallelism_rank(model.clone(), topo, rank))
            .collect())
    }

    /// Every shard address of every model, models in declaration order.
    pub fn all_model_handlers(&self) -> Result<Vec<ModelShardId>, Error> {
        let mut handlers = Vec::new();
        for (model, _) in &self.models {
            handlers.extend(self.handlers_of(model)?);
        }
        Ok(handlers)
    }

    /// The worker hosting `shard`.
    pub fn worker_of(&self, shard: &ModelShardId) -> Result<WorkerId, Error> {
        self.msid2mwid
            .get(shard)
            .copied()
            .ok_or_else(|| Error::Internal {
                message: format!("shard `{shard}` has no placement"),
            })
    }

    /// The architecture card of `model`, if reported already.
    #[must_use]
    pub fn model_config(&self, model: &ModelName) -> Option<ModelConfig> {
        self.model_configs.borrow().get(model).cloned()
    }

    /// The architecture card of `model`, required.
    pub fn require_model_config(&self, model: &ModelName) -> Result<ModelConfig, Error> {
        self.model_config(model).ok_or_else(|| Error::MissingModelConfig {
            model: model.clone(),
        })
    }
}
