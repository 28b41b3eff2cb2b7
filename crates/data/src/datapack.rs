// SPDX-License-Identifier: Apache-2.0

//! Batch composition helpers: first-fit-decreasing bin packing and the
//! balanced contiguous partition used to spread sequences over data-parallel
//! ranks.

use crate::error::Error;

/// Checks whether `items` fit into `n_bins` bins of `capacity` under
/// first-fit-decreasing packing.
#[must_use]
pub fn ffd_check(items: &[u64], capacity: u64, n_bins: usize) -> bool {
    let mut sorted: Vec<u64> = items.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    let mut remaining = vec![capacity; n_bins];
    for size in sorted {
        match remaining.iter_mut().find(|r| **r >= size) {
            Some(r) => *r -= size,
            None => return false,
        }
    }
    true
}

/// First-fit-decreasing bin packing. Returns the packed bins, each a list of
/// indices into `items`, opening a new bin whenever an item fits nowhere.
#[must_use]
pub fn ffd_with_result(items: &[u64], capacity: u64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_unstable_by(|&a, &b| items[b].cmp(&items[a]));

    pack(order.iter().map(|&i| (i, items[i])), capacity)
}

/// First-fit bin packing over the items in their given order.
///
/// Used when the arrival order is meaningful (e.g. streaming datasets) and a
/// full sort would reorder sequences across batches.
#[must_use]
pub fn ffd_with_result_unsorted(items: &[u64], capacity: u64) -> Vec<Vec<usize>> {
    pack(items.iter().copied().enumerate(), capacity)
}

fn pack(items: impl Iterator<Item = (usize, u64)>, capacity: u64) -> Vec<Vec<usize>> {
    let mut remaining: Vec<i64> = Vec::new();
    let mut bins: Vec<Vec<usize>> = Vec::new();
    for (idx, size) in items {
        let slot = remaining.iter().position(|&r| r >= size as i64);
        match slot {
            Some(b) => {
                remaining[b] -= size as i64;
                bins[b].push(idx);
            }
            None => {
                remaining.push(capacity as i64 - size as i64);
                bins.push(vec![idx]);
            }
        }
    }
    bins
}

/// Multifit-style dynamic batch allocator.
///
/// Walks `lengths` in order, binary-searching the longest prefix that still
/// packs into `world_size` bins of `capacity`, packs it with FFD, and keeps
/// the bin belonging to `rank`. Stops when a chunk no longer fills every
/// rank. Returns this rank's bins, each a list of indices into `lengths`.
#[must_use]
pub fn allocate(lengths: &[u64], capacity: u64, rank: usize, world_size: usize) -> Vec<Vec<usize>> {
    let mut cumsum = Vec::with_capacity(lengths.len());
    let mut acc = 0u64;
    for &len in lengths {
        acc += len;
        cumsum.push(acc);
    }

    let mut start = 0usize;
    let mut consumed = 0u64;
    let mut result = Vec::new();

    while start < lengths.len() {
        // Upper bound: no prefix whose token total exceeds the fleet's
        // aggregate capacity can pack.
        let budget = consumed + capacity * world_size as u64;
        let hi = cumsum[start..].partition_point(|&c| c <= budget);

        let mut lo = 1usize;
        let mut hi = hi + 1;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if ffd_check(&lengths[start..start + mid], capacity, world_size) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let take = lo.min(lengths.len() - start);

        let mut batch = ffd_with_result(&lengths[start..start + take], capacity);
        if batch.len() < world_size {
            break;
        }
        for bin in &mut batch {
            for idx in bin.iter_mut() {
                *idx += start;
            }
        }

        start += take;
        consumed = cumsum[start - 1];
        result.push(batch.swap_remove(rank));
    }
    result
}

/// Partitions `weights` into `k` contiguous ranges covering `[0, n)` while
/// minimizing the maximum range sum.
///
/// Solved by O(n²k) dynamic programming over prefix sums. Among equal optima
/// the earliest achievable split wins. Every range holds at least `min_size`
/// items (a `min_size` of 0 is treated as 1).
pub fn min_abs_diff_partition(
    weights: &[u64],
    k: usize,
    min_size: usize,
) -> Result<Vec<(usize, usize)>, Error> {
    let n = weights.len();
    let min_size = min_size.max(1);
    if k == 0 || n < k * min_size {
        return Err(Error::InfeasiblePartition { n, k, min_size });
    }

    let mut prefix = vec![0u64; n + 1];
    for (i, &w) in weights.iter().enumerate() {
        prefix[i + 1] = prefix[i] + w;
    }

    const INF: u64 = u64::MAX;
    // dp[i][j]: minimal achievable maximum over the first i items split into
    // j ranges.
    let mut dp = vec![vec![INF; k + 1]; n + 1];
    for i in min_size..=n {
        dp[i][1] = prefix[i];
    }
    for j in 2..=k {
        for i in (j * min_size)..=n {
            for x in ((j - 1) * min_size)..=(i - min_size) {
                if dp[x][j - 1] == INF {
                    continue;
                }
                let cand = dp[x][j - 1].max(prefix[i] - prefix[x]);
                if cand < dp[i][j] {
                    dp[i][j] = cand;
                }
            }
        }
    }

    // Backtrack, taking the first split that achieves the optimum.
    let mut ranges = Vec::with_capacity(k);
    let mut i = n;
    let mut j = k;
    while j > 1 {
        for x in ((j - 1) * min_size)..=(i - min_size) {
            if dp[x][j - 1] != INF && dp[i][j] == dp[x][j - 1].max(prefix[i] - prefix[x]) {
                ranges.push((x, i));
                i = x;
                j -= 1;
                break;
            }
        }
    }
    ranges.push((0, i));
    ranges.reverse();
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffd_opens_three_bins() {
        let items = [600, 500, 400, 400, 300, 200, 100];
        let bins = ffd_with_result(&items, 1000);
        assert_eq!(bins.len(), 3);
        // Every item is packed exactly once.
        let mut packed: Vec<usize> = bins.iter().flatten().copied().collect();
        packed.sort_unstable();
        assert_eq!(packed, (0..items.len()).collect::<Vec<_>>());
        // No bin overflows.
        for bin in &bins {
            assert!(bin.iter().map(|&i| items[i]).sum::<u64>() <= 1000);
        }

        assert!(ffd_check(&items, 1000, 3));
        assert!(!ffd_check(&items, 1000, 2));
    }

    #[test]
    fn ffd_check_implies_bin_count() {
        let items = [700, 350, 320, 300, 150, 80];
        for n in 1..=items.len() {
            if ffd_check(&items, 1000, n) {
                assert!(ffd_with_result(&items, 1000).len() <= n);
            }
        }
    }

    #[test]
    fn unsorted_packing_preserves_first_fit_order() {
        let items = [100, 900, 200, 800];
        let bins = ffd_with_result_unsorted(&items, 1000);
        assert_eq!(bins, vec![vec![0, 1], vec![2, 3]]);
    }

    fn brute_force_optimum(weights: &[u64], k: usize) -> u64 {
        fn go(weights: &[u64], k: usize, start: usize) -> u64 {
            if k == 1 {
                return weights[start..].iter().sum();
            }
            let n = weights.len();
            let mut best = u64::MAX;
            for end in (start + 1)..=(n - (k - 1)) {
                let head: u64 = weights[start..end].iter().sum();
                best = best.min(head.max(go(weights, k - 1, end)));
            }
            best
        }
        go(weights, k, 0)
    }

    #[test]
    fn balanced_partition_is_optimal() {
        let weights = [3, 1, 4, 1, 5, 9, 2, 6];
        let ranges = min_abs_diff_partition(&weights, 3, 1).expect("feasible");
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges.first(), Some(&(0, ranges[0].1)));
        assert_eq!(ranges.last().map(|r| r.1), Some(weights.len()));
        for w in ranges.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }

        let max_sum = ranges
            .iter()
            .map(|&(s, e)| weights[s..e].iter().sum::<u64>())
            .max()
            .expect("non-empty");
        assert_eq!(max_sum, brute_force_optimum(&weights, 3));
    }

    #[test]
    fn balanced_partition_respects_min_size() {
        let weights = [10, 1, 1, 1, 1, 1, 1, 10];
        let ranges = min_abs_diff_partition(&weights, 3, 2).expect("feasible");
        for &(s, e) in &ranges {
            assert!(e - s >= 2);
        }
        assert!(min_abs_diff_partition(&weights, 5, 2).is_err());
    }

    #[test]
    fn singleton_ranges_cover_everything() {
        let weights = [5, 5, 5];
        let ranges = min_abs_diff_partition(&weights, 3, 1).expect("feasible");
        assert_eq!(ranges, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn allocate_fills_every_rank_under_capacity() {
        let lengths = [400, 300, 500, 200, 600, 100, 350, 250, 700, 150];
        for rank in 0..2 {
            let chunks = allocate(&lengths, 1000, rank, 2);
            assert!(!chunks.is_empty());
            for bin in &chunks {
                assert!(bin.iter().map(|&i| lengths[i]).sum::<u64>() <= 1000);
            }
        }
    }
}
