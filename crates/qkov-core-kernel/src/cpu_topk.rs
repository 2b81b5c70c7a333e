use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Heap entry. `Greater` means "ranks higher": larger score, then smaller index.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    index: usize,
    score: f64,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// The `k` largest entries of `scores` as `(index, score)`, best first.
/// Exact ties go to the lower index. O(n log k).
pub fn top_k_f64(scores: &[f64], k: usize) -> anyhow::Result<Vec<(usize, f64)>> {
    if k > scores.len() {
        anyhow::bail!("top_k: k={} exceeds input length {}", k, scores.len());
    }
    if k == 0 {
        return Ok(Vec::new());
    }

    // min-heap of the best k seen so far; the root is the weakest kept entry
    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
    for (index, &score) in scores.iter().enumerate() {
        let entry = Ranked { index, score };
        if heap.len() < k {
            heap.push(Reverse(entry));
        } else if let Some(Reverse(weakest)) = heap.peek() {
            if entry > *weakest {
                heap.pop();
                heap.push(Reverse(entry));
            }
        }
    }

    Ok(heap
        .into_sorted_vec()
        .into_iter()
        .map(|Reverse(r)| (r.index, r.score))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_top_k_basic() {
        let scores = [0.1, 5.0, -2.0, 3.0, 4.0];
        let top = top_k_f64(&scores, 3).unwrap();
        assert_eq!(top, vec![(1, 5.0), (4, 4.0), (3, 3.0)]);
    }

    #[test]
    fn test_top_k_ties_prefer_lower_index() {
        let scores = [1.0, 7.0, 3.0, 7.0, 7.0];
        let top = top_k_f64(&scores, 2).unwrap();
        assert_eq!(top, vec![(1, 7.0), (3, 7.0)]);
    }

    #[test]
    fn test_top_k_bounds() {
        assert!(top_k_f64(&[1.0, 2.0], 3).is_err());
        assert!(top_k_f64(&[1.0, 2.0], 0).unwrap().is_empty());
        assert_eq!(top_k_f64(&[1.0, 2.0], 2).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_top_k_matches_full_sort(
            scores in prop::collection::vec(-1000i32..1000, 1..200),
            k_seed in 0usize..200,
        ) {
            // integer-valued scores force plenty of exact ties
            let scores: Vec<f64> = scores.into_iter().map(|s| (s / 10) as f64).collect();
            let k = k_seed % (scores.len() + 1);

            let top = top_k_f64(&scores, k).unwrap();

            let mut expected: Vec<(usize, f64)> = scores.iter().copied().enumerate().collect();
            expected.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            expected.truncate(k);

            prop_assert_eq!(top.len(), k);
            prop_assert!(top.windows(2).all(|w| w[0].1 >= w[1].1));
            prop_assert_eq!(top, expected);
        }
    }
}
