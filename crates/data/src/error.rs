// SPDX-License-Identifier: Apache-2.0

//! Errors for the data crate.

/// Errors raised while composing or splitting packed batches.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A sample carries none of the recognized length keys.
    #[error("Cannot determine sequence count; known length keys are absent (keys: {keys:?})")]
    UnknownSeqLens {
        /// The keys the sample does carry.
        keys: Vec<String>,
    },

    /// A length key holds a tensor of the wrong kind.
    #[error("Length key `{key}` is not readable length metadata")]
    BadLengthKey {
        /// The offending key.
        key: String,
    },

    /// A partition range is out of bounds or inverted.
    #[error("Partition ({start}, {end}) is invalid for {n_seqs} sequences")]
    InvalidPartition {
        /// Range start (inclusive).
        start: usize,
        /// Range end (exclusive).
        end: usize,
        /// Number of sequences being partitioned.
        n_seqs: usize,
    },

    /// A blob's row count matches neither the token count nor the sequence
    /// count of its batch, so it cannot be sliced along sequences.
    #[error("Key `{key}` has {rows} rows; expected {n_tokens} (token-major) or {n_seqs} (seq-major)")]
    MismatchedRows {
        /// The offending key.
        key: String,
        /// Rows the blob actually has.
        rows: usize,
        /// Token count of the batch.
        n_tokens: usize,
        /// Sequence count of the batch.
        n_seqs: usize,
    },

    /// Samples being gathered disagree on their key sets or tensor types.
    #[error("Samples are not gatherable: {reason}")]
    Ungatherable {
        /// What differed between the samples.
        reason: String,
    },

    /// A balanced partition cannot satisfy its constraints.
    #[error("Cannot partition {n} items into {k} ranges of at least {min_size}")]
    InfeasiblePartition {
        /// Number of items.
        n: usize,
        /// Number of ranges requested.
        k: usize,
        /// Minimum range length.
        min_size: usize,
    },
}
