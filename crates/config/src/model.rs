// SPDX-License-Identifier: Apache-2.0

//! Model identities, parallelism topologies and shard addresses.

use crate::RoleName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The identity of one model replica.
///
/// Two replicas of the same role can live concurrently (e.g. a training
/// replica and a generation replica of the actor, kept in sync through
/// parameter reallocation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelName {
    /// The functional role of the model (e.g. `actor`, `critic`, `reward`).
    pub role: RoleName,
    /// Replica index within the role. Replica 0 is the canonical replica.
    #[serde(default)]
    pub replica_id: u32,
}

impl ModelName {
    /// Creates a model name from a role and replica index.
    pub fn new(role: impl Into<RoleName>, replica_id: u32) -> Self {
        Self {
            role: role.into(),
            replica_id,
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.replica_id)
    }
}

/// A 3D parallelism layout: pipeline, tensor(model) and data dimensions.
///
/// Rank layout is row-major in `(pipe, model, data)` order: the data
/// coordinate varies fastest, the pipeline coordinate slowest. This matches
/// the layout model workers use to derive their own coordinates, so a
/// `parallelism_rank` computed here addresses the same shard everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    /// Number of pipeline-parallel stages.
    pub pipe: usize,
    /// Number of tensor(model)-parallel partitions.
    pub model: usize,
    /// Number of data-parallel slices.
    pub data: usize,
}

/// The coordinate of one parallelism rank inside a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelCoord {
    /// Pipeline stage index.
    pub pipe: usize,
    /// Tensor(model) partition index.
    pub model: usize,
    /// Data-parallel slice index.
    pub data: usize,
}

impl Topology {
    /// Creates a topology from its three dimensions.
    #[must_use]
    pub const fn new(pipe: usize, model: usize, data: usize) -> Self {
        Self { pipe, model, data }
    }

    /// Total number of ranks in this topology.
    #[must_use]
    pub const fn world_size(&self) -> usize {
        self.pipe * self.model * self.data
    }

    /// Returns the coordinate of `rank`, or `None` when out of range.
    #[must_use]
    pub const fn coord(&self, rank: usize) -> Option<ParallelCoord> {
        if rank >= self.world_size() {
            return None;
        }
        Some(ParallelCoord {
            pipe: rank / (self.model * self.data),
            model: (rank / self.data) % self.model,
            data: rank % self.data,
        })
    }

    /// Returns the rank at `coord`, or `None` when any coordinate is out of
    /// range.
    #[must_use]
    pub const fn rank_of(&self, coord: ParallelCoord) -> Option<usize> {
        if coord.pipe >= self.pipe || coord.model >= self.model || coord.data >= self.data {
            return None;
        }
        Some(coord.pipe * self.model * self.data + coord.model * self.data + coord.data)
    }

    /// The dp-head rank of data slice `dp`: the shard at the last pipeline
    /// stage with model coordinate 0. Its reply carries the outputs of the
    /// whole slice, so it is the only shard the master collects from.
    #[must_use]
    pub fn dp_head_rank(&self, dp: usize) -> Option<usize> {
        let pipe = self.pipe.checked_sub(1)?;
        self.rank_of(ParallelCoord {
            pipe,
            model: 0,
            data: dp,
        })
    }

    /// The dp-head ranks of every data slice, in slice order.
    #[must_use]
    pub fn dp_head_ranks(&self) -> Vec<usize> {
        (0..self.data).filter_map(|dp| self.dp_head_rank(dp)).collect()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}model{}data{}", self.pipe, self.model, self.data)
    }
}

/// The address of one model shard: a model replica plus a parallelism rank.
///
/// This is the handler unit of the request stream; every payload the master
/// posts is addressed to one shard (or to a data worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelShardId {
    /// The model replica this shard belongs to.
    pub model_name: ModelName,
    /// The shard's rank inside the model's topology.
    pub parallelism_rank: usize,
    /// The topology of the owning model.
    pub topology: Topology,
}

impl ModelShardId {
    /// Creates the shard address for `rank` of `model_name` under `topology`.
    #[must_use]
    pub const fn from_parallelism_rank(
        model_name: ModelName,
        topology: Topology,
        rank: usize,
    ) -> Self {
        Self {
            model_name,
            parallelism_rank: rank,
            topology,
        }
    }

    /// The parallelism coordinate of this shard.
    #[must_use]
    pub const fn coord(&self) -> Option<ParallelCoord> {
        self.topology.coord(self.parallelism_rank)
    }

    /// The data-parallel slice this shard belongs to.
    #[must_use]
    pub const fn dp_rank(&self) -> Option<usize> {
        match self.coord() {
            Some(c) => Some(c.data),
            None => None,
        }
    }

    /// Whether this shard is the dp-head of its data slice.
    #[must_use]
    pub fn is_dp_head(&self) -> bool {
        self.dp_rank()
            .and_then(|dp| self.topology.dp_head_rank(dp))
            .is_some_and(|head| head == self.parallelism_rank)
    }
}

impl fmt::Display for ModelShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.model_name, self.parallelism_rank)
    }
}

/// Architecture card of a model, reported by workers at init.
///
/// The master never touches weights; these numbers feed throughput
/// estimation only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers.
    pub n_layers: usize,
    /// Hidden dimension.
    pub hidden_dim: usize,
    /// Feed-forward intermediate dimension.
    pub intermediate_dim: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_coord_round_trip() {
        let topo = Topology::new(4, 2, 3);
        for rank in 0..topo.world_size() {
            let coord = topo.coord(rank).expect("rank in range");
            assert_eq!(topo.rank_of(coord), Some(rank));
        }
        assert_eq!(topo.coord(topo.world_size()), None);
    }

    #[test]
    fn data_varies_fastest() {
        let topo = Topology::new(2, 2, 2);
        assert_eq!(
            topo.coord(1),
            Some(ParallelCoord {
                pipe: 0,
                model: 0,
                data: 1
            })
        );
        assert_eq!(
            topo.coord(4),
            Some(ParallelCoord {
                pipe: 1,
                model: 0,
                data: 0
            })
        );
    }

    #[test]
    fn dp_head_is_last_stage_model_zero() {
        let topo = Topology::new(3, 2, 2);
        let head = topo.dp_head_rank(1).expect("dp in range");
        let coord = topo.coord(head).expect("head in range");
        assert_eq!(coord.pipe, 2);
        assert_eq!(coord.model, 0);
        assert_eq!(coord.data, 1);

        let shard = ModelShardId::from_parallelism_rank(ModelName::new("actor", 0), topo, head);
        assert!(shard.is_dp_head());
    }

    #[test]
    fn dp_head_ranks_cover_all_slices() {
        let topo = Topology::new(2, 1, 4);
        let heads = topo.dp_head_ranks();
        assert_eq!(heads.len(), 4);
        for (dp, rank) in heads.iter().enumerate() {
            assert_eq!(topo.coord(*rank).expect("in range").data, dp);
        }
    }
}
