// SPDX-License-Identifier: Apache-2.0

//! Dataflow-graph construction and validation.
//!
//! Nodes are model RPCs; an edge runs from producer to consumer whenever a
//! (remapped) output key of the producer appears among the consumer's input
//! keys. The graph is validated once: acyclicity, unique key producers, at
//! least one source and one terminal, and per-RPC sanity. After that the
//! scheduler never re-checks any of it.

use crate::error::Error;
use crate::rpc::ModelRpc;
use crate::{DataKey, RpcName};
use std::collections::HashMap;

/// A validated dataflow graph of model RPCs.
#[derive(Debug, Clone)]
pub struct DataflowGraph {
    rpcs: Vec<ModelRpc>,
    index: HashMap<RpcName, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
}

impl DataflowGraph {
    /// Builds and validates the graph from its RPCs.
    ///
    /// Collects every validation error before failing, so a broken experiment
    /// config surfaces all its problems at once.
    pub fn build(rpcs: Vec<ModelRpc>) -> Result<Self, Error> {
        let mut errors = Vec::new();

        let mut index = HashMap::new();
        for (i, rpc) in rpcs.iter().enumerate() {
            if index.insert(rpc.name.clone(), i).is_some() {
                errors.push(Error::DuplicateRpc {
                    name: rpc.name.clone(),
                });
            }
        }

        for rpc in &rpcs {
            if rpc.min_n_seqs > rpc.max_n_seqs {
                errors.push(Error::BatchSizeRange {
                    rpc: rpc.name.clone(),
                    min: rpc.min_n_seqs,
                    max: rpc.max_n_seqs,
                });
            }
            if rpc.max_concurrent_calls == 0 {
                errors.push(Error::ZeroConcurrency {
                    rpc: rpc.name.clone(),
                });
            }
            for hook in rpc.pre_hooks.iter().chain(&rpc.post_hooks) {
                if !hook.endpoints_valid() {
                    errors.push(Error::InvalidHookEndpoints {
                        rpc: rpc.name.clone(),
                    });
                }
            }
        }

        // A key may have at most one producer; the data-owner registry relies
        // on it.
        let mut producer_of: HashMap<DataKey, usize> = HashMap::new();
        for (i, rpc) in rpcs.iter().enumerate() {
            for key in rpc.produced_keys() {
                if let Some(&first) = producer_of.get(key) {
                    errors.push(Error::DuplicateProducer {
                        key: key.clone(),
                        first: rpcs[first].name.clone(),
                        second: rpc.name.clone(),
                    });
                } else {
                    let _ = producer_of.insert(key.clone(), i);
                }
            }
        }

        let mut parents = vec![Vec::new(); rpcs.len()];
        let mut children = vec![Vec::new(); rpcs.len()];
        for (i, rpc) in rpcs.iter().enumerate() {
            for key in &rpc.input_keys {
                if let Some(&p) = producer_of.get(key) {
                    if p != i && !parents[i].contains(&p) {
                        parents[i].push(p);
                        children[p].push(i);
                    }
                }
                // Keys with no RPC producer come from the dataset via the
                // source RPC's data workers.
            }
        }

        let topo_order = match topological_order(&rpcs, &children, &parents) {
            Ok(order) => {
                // Source/terminal checks are only meaningful on an acyclic
                // graph; a cycle already implies both are violated. An empty
                // graph fails them too.
                if !parents.iter().any(Vec::is_empty) {
                    errors.push(Error::NoSourceRpc);
                }
                if !children.iter().any(Vec::is_empty) {
                    errors.push(Error::NoTerminalRpc);
                }
                order
            }
            Err(e) => {
                errors.push(e);
                Vec::new()
            }
        };

        if errors.len() == 1 {
            return Err(errors.remove(0));
        }
        if !errors.is_empty() {
            return Err(Error::InvalidConfiguration { errors });
        }

        Ok(Self {
            rpcs,
            index,
            parents,
            children,
            topo_order,
        })
    }

    /// All RPCs, in declaration order.
    #[must_use]
    pub fn rpcs(&self) -> &[ModelRpc] {
        &self.rpcs
    }

    /// The RPC at `idx`.
    #[must_use]
    pub fn rpc(&self, idx: usize) -> &ModelRpc {
        &self.rpcs[idx]
    }

    /// Looks an RPC up by name.
    #[must_use]
    pub fn rpc_by_name(&self, name: &RpcName) -> Option<&ModelRpc> {
        self.index.get(name).map(|&i| &self.rpcs[i])
    }

    /// Indices of the DFG parents of `idx`.
    #[must_use]
    pub fn parents_of(&self, idx: usize) -> &[usize] {
        &self.parents[idx]
    }

    /// Indices of the DFG children of `idx`.
    #[must_use]
    pub fn children_of(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    /// Whether the RPC at `idx` has no DFG parents.
    #[must_use]
    pub fn is_src(&self, idx: usize) -> bool {
        self.parents[idx].is_empty()
    }

    /// Whether the RPC at `idx` has no DFG children.
    #[must_use]
    pub fn is_dst(&self, idx: usize) -> bool {
        self.children[idx].is_empty()
    }

    /// Indices of source RPCs, in declaration order.
    pub fn sources(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rpcs.len()).filter(|&i| self.is_src(i))
    }

    /// Indices of terminal RPCs, in declaration order.
    pub fn terminals(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rpcs.len()).filter(|&i| self.is_dst(i))
    }

    /// A topological order of the graph (producers before consumers).
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.topo_order
    }
}

fn topological_order(
    rpcs: &[ModelRpc],
    children: &[Vec<usize>],
    parents: &[Vec<usize>],
) -> Result<Vec<usize>, Error> {
    let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut queue: Vec<usize> = (0..rpcs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(rpcs.len());

    while let Some(i) = queue.pop() {
        order.push(i);
        for &c in &children[i] {
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                queue.push(c);
            }
        }
    }

    if order.len() != rpcs.len() {
        let nodes = (0..rpcs.len())
            .filter(|&i| !order.contains(&i))
            .map(|i| rpcs[i].name.clone())
            .collect();
        return Err(Error::CycleDetected { nodes });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelName;
    use crate::rpc::ModelInterfaceType;
    use indexmap::IndexMap;

    fn rpc(name: &'static str, model: &'static str, inputs: &[&str], outputs: &[&str]) -> ModelRpc {
        ModelRpc {
            name: name.into(),
            model_name: ModelName::new(model, 0),
            interface_type: ModelInterfaceType::Inference,
            input_keys: inputs.iter().map(|k| DataKey::from((*k).to_owned())).collect(),
            output_keys: outputs.iter().map(|k| DataKey::from((*k).to_owned())).collect(),
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

    #[test]
    fn chain_edges_and_roles() {
        let g = DataflowGraph::build(vec![
            rpc("gen", "actor", &["prompts"], &["seq"]),
            rpc("ref", "ref", &["seq"], &["ref_logp"]),
            rpc("train", "actor", &["seq", "ref_logp"], &[]),
        ])
        .expect("valid graph");

        assert!(g.is_src(0));
        assert!(!g.is_src(1));
        assert!(g.is_dst(2));
        assert_eq!(g.children_of(0), &[1, 2]);
        assert_eq!(g.parents_of(2), &[0, 1]);

        let order = g.topological_order();
        let pos = |n: usize| order.iter().position(|&i| i == n).expect("in order");
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn cycle_rejected() {
        let err = DataflowGraph::build(vec![
            rpc("a", "actor", &["y"], &["x"]),
            rpc("b", "ref", &["x"], &["y"]),
        ])
        .expect_err("cyclic graph");
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn duplicate_producer_rejected() {
        let err = DataflowGraph::build(vec![
            rpc("a", "actor", &["p"], &["x"]),
            rpc("b", "ref", &["p"], &["x"]),
            rpc("c", "critic", &["x"], &[]),
        ])
        .expect_err("two producers of x");
        match err {
            Error::DuplicateProducer { key, .. } => assert_eq!(key, DataKey::from("x")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn remapped_output_creates_edge() {
        let mut r#gen = rpc("gen", "actor", &["prompts"], &["raw_seq"]);
        let _ = r#gen
            .output_key_remap
            .insert("raw_seq".into(), "seq".into());
        let g = DataflowGraph::build(vec![r#gen, rpc("train", "actor", &["seq"], &[])])
            .expect("valid graph");
        assert_eq!(g.children_of(0), &[1]);
    }

    #[test]
    fn min_over_max_rejected() {
        let mut bad = rpc("a", "actor", &["p"], &[]);
        bad.min_n_seqs = 32;
        bad.max_n_seqs = 16;
        let err = DataflowGraph::build(vec![bad]).expect_err("bad batch range");
        assert!(matches!(err, Error::BatchSizeRange { .. }));
    }
}
