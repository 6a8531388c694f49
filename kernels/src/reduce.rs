use crate::{KernelElem, ReduceOp};
use rayon::prelude::*;

/// Tree reduction of `values` with `op`.
///
/// Each round folds the upper half onto the lower half in parallel. When a
/// round starts with an odd count, the last element is first folded into
/// element 0 by one sequential step, so no padding is needed. An empty input
/// yields the identity of `op`.
pub fn tree_reduce<T: KernelElem>(mut values: Vec<T>, op: ReduceOp) -> T {
    while values.len() > 1 {
        if values.len() % 2 == 1 {
            if let Some(tail) = values.pop() {
                values[0] = op.combine(values[0], tail);
            }
        }
        let half = values.len() / 2;
        let (lo, hi) = values.split_at_mut(half);
        lo.par_iter_mut()
            .zip(hi.par_iter())
            .for_each(|(a, &b)| *a = op.combine(*a, b));
        values.truncate(half);
    }
    values.first().copied().unwrap_or_else(|| op.identity())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_reduce_power_of_two() {
        let values: Vec<f64> = (1..=8).map(|i| i as f64).collect();
        assert_eq!(tree_reduce(values, ReduceOp::Sum), 36.0);
    }

    #[test]
    fn test_tree_reduce_odd_tails() {
        for n in [1usize, 3, 5, 7, 9, 1000, 1023] {
            let values: Vec<f64> = (1..=n).map(|i| i as f64).collect();
            let expected = (n * (n + 1) / 2) as f64;
            assert_eq!(tree_reduce(values, ReduceOp::Sum), expected, "n = {}", n);
        }
    }

    #[test]
    fn test_tree_reduce_min_max() {
        let values = vec![3.0f32, -7.0, 2.5, 9.0, 0.0];
        assert_eq!(tree_reduce(values.clone(), ReduceOp::Min), -7.0);
        assert_eq!(tree_reduce(values, ReduceOp::Max), 9.0);
    }

    #[test]
    fn test_tree_reduce_empty() {
        assert_eq!(tree_reduce(Vec::<f64>::new(), ReduceOp::Sum), 0.0);
        assert_eq!(tree_reduce(Vec::<f64>::new(), ReduceOp::Product), 1.0);
        assert_eq!(
            tree_reduce(Vec::<f64>::new(), ReduceOp::Max),
            f64::NEG_INFINITY
        );
    }
}
