// SPDX-License-Identifier: Apache-2.0

//! The data broker: splits a packed sample along sequence boundaries and
//! concatenates packed samples back together. Only descriptors move; the
//! workers perform the actual gather/scatter on tensor bytes.

use crate::error::Error;
use crate::sample::{SeqSample, TensorData};
use indexmap::IndexMap;

/// Splits `sample` into `n_dp` packed samples aligned to `partitions`
/// (sequence ranges, one per destination).
pub fn scatter_to(
    sample: &SeqSample,
    n_dp: usize,
    partitions: &[(usize, usize)],
) -> Result<Vec<SeqSample>, Error> {
    let seqlens = sample.seqlens()?;
    let n_seqs = seqlens.len();
    if partitions.len() != n_dp {
        return Err(Error::InvalidPartition {
            start: 0,
            end: partitions.len(),
            n_seqs: n_dp,
        });
    }

    let mut cu = vec![0usize; n_seqs + 1];
    for (i, &l) in seqlens.iter().enumerate() {
        cu[i + 1] = cu[i] + l as usize;
    }
    let n_tokens = cu[n_seqs];

    let mut out = Vec::with_capacity(n_dp);
    for &(start, end) in partitions {
        if start > end || end > n_seqs {
            return Err(Error::InvalidPartition {
                start,
                end,
                n_seqs,
            });
        }
        let mut split = SeqSample::new();
        for (key, data) in &sample.entries {
            let sliced = match data {
                TensorData::Lens(lens) => TensorData::Lens(lens[start..end].to_vec()),
                TensorData::CuSeqlens(prefix) => TensorData::CuSeqlens(
                    prefix[start..=end].iter().map(|&v| v - prefix[start]).collect(),
                ),
                TensorData::Blob(blob) => {
                    let rows = blob.rows();
                    if rows == n_tokens {
                        TensorData::Blob(blob.slice_rows(cu[start], cu[end]))
                    } else if rows == n_seqs {
                        TensorData::Blob(blob.slice_rows(start, end))
                    } else {
                        return Err(Error::MismatchedRows {
                            key: key.clone(),
                            rows,
                            n_tokens,
                            n_seqs,
                        });
                    }
                }
            };
            let _ = split.entries.insert(key.clone(), sliced);
        }
        out.push(split);
    }
    Ok(out)
}

/// Concatenates packed samples along the sequence axis, in the order given.
///
/// All samples must agree on key order and tensor types. Adjacent blob runs
/// over the same backing storage are merged, so gathering the output of
/// [`scatter_to`] reconstructs the original descriptors exactly.
pub fn gather_from(samples: &[SeqSample]) -> Result<SeqSample, Error> {
    let Some(first) = samples.first() else {
        return Err(Error::Ungatherable {
            reason: "no samples to gather".to_owned(),
        });
    };

    let mut out = first.clone();
    for sample in &samples[1..] {
        if !sample.entries.keys().eq(out.entries.keys()) {
            return Err(Error::Ungatherable {
                reason: format!(
                    "key mismatch: {:?} vs {:?}",
                    out.keys().collect::<Vec<_>>(),
                    sample.keys().collect::<Vec<_>>()
                ),
            });
        }
        for (key, data) in &sample.entries {
            let acc = out
                .entries
                .get_mut(key)
                .ok_or_else(|| Error::Ungatherable {
                    reason: format!("missing key `{key}`"),
                })?;
            match (acc, data) {
                (TensorData::Lens(acc), TensorData::Lens(more)) => acc.extend_from_slice(more),
                (TensorData::CuSeqlens(acc), TensorData::CuSeqlens(more)) => {
                    let base = *acc.last().unwrap_or(&0);
                    acc.extend(more.iter().skip(1).map(|&v| base + v));
                }
                (TensorData::Blob(acc), TensorData::Blob(more)) => {
                    if acc.dtype != more.dtype || acc.row_numel != more.row_numel {
                        return Err(Error::Ungatherable {
                            reason: format!("tensor layout mismatch for key `{key}`"),
                        });
                    }
                    acc.append(more);
                }
                _ => {
                    return Err(Error::Ungatherable {
                        reason: format!("tensor kind mismatch for key `{key}`"),
                    });
                }
            }
        }
    }
    Ok(out)
}

/// Splits a packed sample into one sample per sequence.
pub fn split_into_seqs(sample: &SeqSample) -> Result<Vec<SeqSample>, Error> {
    let n = sample.n_seqs()?;
    let partitions: Vec<(usize, usize)> = (0..n).map(|i| (i, i + 1)).collect();
    scatter_to(sample, n, &partitions)
}

/// Merges per-worker scalar logs by averaging each key over the workers that
/// reported it.
#[must_use]
pub fn gather_scalars(dicts: &[IndexMap<String, f64>]) -> IndexMap<String, f64> {
    let mut sums: IndexMap<String, (f64, usize)> = IndexMap::new();
    for dict in dicts {
        for (key, &value) in dict {
            let entry = sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(k, (sum, n))| (k, sum / n as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{BlobSpec, DType};
    use pretty_assertions::assert_eq;

    fn sample() -> SeqSample {
        let mut s = SeqSample::new();
        let _ = s
            .entries
            .insert("input_lens".into(), TensorData::Lens(vec![3, 5, 2, 6]));
        let _ = s.entries.insert(
            "cu_seqlens".into(),
            TensorData::CuSeqlens(vec![0, 3, 8, 10, 16]),
        );
        let _ = s.entries.insert(
            "packed_seq".into(),
            TensorData::Blob(BlobSpec::contiguous(DType::I32, 1, 1, 16)),
        );
        let _ = s.entries.insert(
            "rewards".into(),
            TensorData::Blob(BlobSpec::contiguous(DType::F32, 1, 2, 4)),
        );
        s
    }

    #[test]
    fn scatter_slices_token_and_seq_major_blobs() {
        let parts = [(0, 1), (1, 3), (3, 4)];
        let shards = scatter_to(&sample(), 3, &parts).expect("valid partitions");

        assert_eq!(shards[1].seqlens().expect("lens"), vec![5, 2]);
        let TensorData::Blob(seq) = &shards[1].entries["packed_seq"] else {
            panic!("packed_seq must stay a blob");
        };
        assert_eq!(seq.rows(), 7);
        assert_eq!(seq.segments[0].start, 3);
        let TensorData::Blob(rewards) = &shards[1].entries["rewards"] else {
            panic!("rewards must stay a blob");
        };
        assert_eq!(rewards.rows(), 2);
        assert_eq!(rewards.segments[0].start, 1);
        let TensorData::CuSeqlens(cu) = &shards[1].entries["cu_seqlens"] else {
            panic!("cu_seqlens must stay a prefix sum");
        };
        assert_eq!(cu, &vec![0, 5, 7]);
    }

    #[test]
    fn gather_inverts_scatter() {
        let original = sample();
        for parts in [
            vec![(0, 1), (1, 3), (3, 4)],
            vec![(0, 2), (2, 4)],
            vec![(0, 4)],
            vec![(0, 1), (1, 2), (2, 3), (3, 4)],
        ] {
            let shards = scatter_to(&original, parts.len(), &parts).expect("valid partitions");
            let gathered = gather_from(&shards).expect("gatherable");
            assert_eq!(gathered, original);
        }
    }

    #[test]
    fn split_into_seqs_yields_one_sample_per_sequence() {
        let seqs = split_into_seqs(&sample()).expect("splittable");
        assert_eq!(seqs.len(), 4);
        assert_eq!(seqs[2].seqlens().expect("lens"), vec![2]);
    }

    #[test]
    fn bad_partition_rejected() {
        let err = scatter_to(&sample(), 1, &[(2, 9)]).expect_err("out of range");
        assert!(matches!(err, Error::InvalidPartition { .. }));
    }

    #[test]
    fn scalar_gather_averages_per_key() {
        let a: IndexMap<String, f64> = [("loss".to_owned(), 2.0), ("kl".to_owned(), 0.5)]
            .into_iter()
            .collect();
        let b: IndexMap<String, f64> = [("loss".to_owned(), 4.0)].into_iter().collect();
        let merged = gather_scalars(&[a, b]);
        assert_eq!(merged["loss"], 3.0);
        assert_eq!(merged["kl"], 0.5);
    }
}
