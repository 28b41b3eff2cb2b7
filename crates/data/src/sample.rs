// SPDX-License-Identifier: Apache-2.0

//! The packed-batch descriptor model.
//!
//! A `SeqSample` is a sequence-first concatenation of variable-length
//! records, described entirely by metadata. Length keys (`input_lens`,
//! `cu_seqlens`, `prompt_lens`, `prompt_cu_seqlens`) are readable by the
//! master; every other attribute is an opaque blob reference resolved by the
//! workers that own the bytes.

use crate::error::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Length keys, in resolution order. Generated-text lengths take precedence
/// over prompt lengths.
const LENGTH_KEYS: [&str; 4] = ["input_lens", "cu_seqlens", "prompt_lens", "prompt_cu_seqlens"];

/// Element type of a tensor, as a tag. The master never interprets bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// Boolean mask.
    Bool,
    /// 32-bit signed integer (token ids, lengths).
    I32,
    /// 64-bit signed integer.
    I64,
    /// 16-bit float.
    F16,
    /// bfloat16.
    Bf16,
    /// 32-bit float.
    F32,
}

/// One contiguous run of rows inside a worker-resident blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSegment {
    /// Opaque handle of the backing blob.
    pub handle: u64,
    /// First row of the run.
    pub start: usize,
    /// Number of rows in the run.
    pub rows: usize,
}

/// A typed, possibly segmented view over worker-resident tensor bytes.
///
/// Rows are either token-major (one row per packed token) or sequence-major
/// (one row per sequence); which one is inferred from the row count when
/// slicing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSpec {
    /// Element type tag.
    pub dtype: DType,
    /// Elements per row.
    pub row_numel: usize,
    /// The runs making up this view, in order.
    pub segments: SmallVec<[BlobSegment; 1]>,
}

impl BlobSpec {
    /// Creates a single-segment blob view.
    #[must_use]
    pub fn contiguous(dtype: DType, row_numel: usize, handle: u64, rows: usize) -> Self {
        Self {
            dtype,
            row_numel,
            segments: smallvec::smallvec![BlobSegment {
                handle,
                start: 0,
                rows,
            }],
        }
    }

    /// Total number of rows across segments.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.segments.iter().map(|s| s.rows).sum()
    }

    /// The view over rows `row_start..row_end`.
    pub(crate) fn slice_rows(&self, row_start: usize, row_end: usize) -> Self {
        let mut segments = SmallVec::new();
        let mut skipped = 0usize;
        let mut wanted = row_end - row_start;
        for seg in &self.segments {
            if wanted == 0 {
                break;
            }
            let seg_end = skipped + seg.rows;
            if seg_end <= row_start {
                skipped = seg_end;
                continue;
            }
            let local_start = row_start.saturating_sub(skipped);
            let take = (seg.rows - local_start).min(wanted);
            segments.push(BlobSegment {
                handle: seg.handle,
                start: seg.start + local_start,
                rows: take,
            });
            wanted -= take;
            skipped = seg_end;
        }
        Self {
            dtype: self.dtype,
            row_numel: self.row_numel,
            segments,
        }
    }

    /// Appends another view, merging adjacent runs of the same blob.
    pub(crate) fn append(&mut self, other: &Self) {
        for seg in &other.segments {
            if let Some(last) = self.segments.last_mut() {
                if last.handle == seg.handle && last.start + last.rows == seg.start {
                    last.rows += seg.rows;
                    continue;
                }
            }
            self.segments.push(*seg);
        }
    }
}

/// One attribute of a packed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    /// Per-sequence lengths, readable by the master.
    Lens(Vec<u32>),
    /// Prefix-sum sequence index (`n_seqs + 1` entries, starting at 0).
    CuSeqlens(Vec<u32>),
    /// Opaque tensor bytes resolved by workers.
    Blob(BlobSpec),
}

/// A packed batch of variable-length sequences, metadata only.
///
/// Key order is preserved and is part of the gather contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqSample {
    /// Attribute key → descriptor.
    pub entries: IndexMap<String, TensorData>,
}

impl SeqSample {
    /// Creates an empty sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute keys, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of sequences, resolved through the length keys.
    pub fn n_seqs(&self) -> Result<usize, Error> {
        self.seqlens().map(|l| l.len())
    }

    /// Per-sequence lengths, resolved through the length keys in order.
    pub fn seqlens(&self) -> Result<Vec<u32>, Error> {
        for key in LENGTH_KEYS {
            let Some(data) = self.entries.get(key) else {
                continue;
            };
            return match data {
                TensorData::Lens(lens) => Ok(lens.clone()),
                TensorData::CuSeqlens(cu) => {
                    Ok(cu.windows(2).map(|w| w[1] - w[0]).collect())
                }
                TensorData::Blob(_) => Err(Error::BadLengthKey {
                    key: key.to_owned(),
                }),
            };
        }
        Err(Error::UnknownSeqLens {
            keys: self.keys().map(str::to_owned).collect(),
        })
    }

    /// Total number of packed tokens.
    pub fn n_tokens(&self) -> Result<usize, Error> {
        Ok(self.seqlens()?.iter().map(|&l| l as usize).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqlens_resolution_order_prefers_generated_lengths() {
        let mut sample = SeqSample::new();
        let _ = sample
            .entries
            .insert("prompt_lens".into(), TensorData::Lens(vec![4, 4]));
        let _ = sample
            .entries
            .insert("input_lens".into(), TensorData::Lens(vec![9, 7]));
        assert_eq!(sample.seqlens().expect("lens present"), vec![9, 7]);
    }

    #[test]
    fn cu_seqlens_differences() {
        let mut sample = SeqSample::new();
        let _ = sample
            .entries
            .insert("cu_seqlens".into(), TensorData::CuSeqlens(vec![0, 3, 8, 9]));
        assert_eq!(sample.seqlens().expect("cu present"), vec![3, 5, 1]);
        assert_eq!(sample.n_tokens().expect("cu present"), 9);
    }

    #[test]
    fn missing_length_keys_is_an_error() {
        let mut sample = SeqSample::new();
        let _ = sample.entries.insert(
            "rewards".into(),
            TensorData::Blob(BlobSpec::contiguous(DType::F32, 1, 7, 2)),
        );
        assert!(matches!(
            sample.seqlens(),
            Err(Error::UnknownSeqLens { .. })
        ));
    }

    #[test]
    fn blob_slice_and_append_round_trip() {
        let blob = BlobSpec::contiguous(DType::F16, 4, 42, 10);
        let mut head = blob.slice_rows(0, 3);
        let mid = blob.slice_rows(3, 7);
        let tail = blob.slice_rows(7, 10);
        assert_eq!(head.rows(), 3);
        assert_eq!(mid.segments[0].start, 3);

        head.append(&mid);
        head.append(&tail);
        assert_eq!(head, blob);
    }
}
