// SPDX-License-Identifier: Apache-2.0

//! Finetuning specification and data-worker batches.

use crate::sample::SeqSample;
use serde::{Deserialize, Serialize};

/// Shape of the finetuning run, reported once by data worker 0 and broadcast
/// to every model shard at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinetuneSpec {
    /// Sequences per device per step.
    pub batch_size_per_device: usize,
    /// Optimizer steps per epoch.
    pub steps_per_epoch: u64,
    /// Total epochs; filled in by the master from the experiment controls.
    #[serde(default)]
    pub total_train_epochs: u64,
    /// Total steps; `total_train_epochs * steps_per_epoch`.
    #[serde(default)]
    pub total_train_steps: u64,
}

/// One fetched chunk of dataset sequences from a data worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    /// Epoch counter of the data loader, starting at 0. A bump signals that
    /// the dataset wrapped around.
    pub epoch: u64,
    /// The fetched sequences, packed.
    pub data: SeqSample,
}
