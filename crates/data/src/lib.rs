// SPDX-License-Identifier: Apache-2.0

//! Packed variable-length batches and batch composition for trainflow.
//!
//! The master coordinator never touches tensor bytes. A batch here is pure
//! metadata: per-sequence lengths plus, for every attribute key, a typed
//! descriptor of where the bytes live on the worker fleet. Scatter/gather,
//! bin packing and balanced partitioning all operate on this metadata and
//! leave the NCCL-level data movement to the workers.

pub mod broker;
pub mod datapack;
pub mod error;
pub mod sample;
pub mod spec;

pub use broker::{gather_from, gather_scalars, scatter_to, split_into_seqs};
pub use datapack::{allocate, ffd_check, ffd_with_result, ffd_with_result_unsorted, min_abs_diff_partition};
pub use error::Error;
pub use sample::{BlobSegment, BlobSpec, DType, SeqSample, TensorData};
pub use spec::{DataBatch, FinetuneSpec};
