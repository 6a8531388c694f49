//! Partition planning.
//!
//! A partition splits `0..n` into one contiguous range per shard. Shard sizes
//! differ by at most one element and the larger shards come first, so the
//! plan depends on `(n, shards)` alone.

use crate::{Error, Result};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    /// `shards + 1` non-decreasing boundaries, from `0` to `n`.
    bounds: Vec<usize>,
}

impl Partition {
    /// Plans `n` elements over `shards` shards.
    ///
    /// The first `n % shards` shards get `ceil(n / shards)` elements, the rest
    /// get `floor(n / shards)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPartition` if `shards` is zero.
    pub fn plan(n: usize, shards: usize) -> Result<Self> {
        if shards == 0 {
            return Err(Error::InvalidPartition(format!(
                "cannot split {} elements over zero shards",
                n
            )));
        }
        let base = n / shards;
        let extra = n % shards;
        let mut bounds = Vec::with_capacity(shards + 1);
        bounds.push(0);
        let mut end = 0;
        for shard in 0..shards {
            end += base + usize::from(shard < extra);
            bounds.push(end);
        }
        Ok(Self { bounds })
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.bounds.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.bounds.len() - 1
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.bounds
    }

    pub fn range(&self, shard: usize) -> Range<usize> {
        self.bounds[shard]..self.bounds[shard + 1]
    }

    pub fn part_start(&self, shard: usize) -> usize {
        self.bounds[shard]
    }

    pub fn part_size(&self, shard: usize) -> usize {
        self.bounds[shard + 1] - self.bounds[shard]
    }

    /// Shard owning global `index` and the offset within it.
    ///
    /// Empty shards never own anything: the last shard whose start is at or
    /// before `index` is the owner.
    pub fn locate(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.len() {
            return Err(Error::IndexOutOfBounds {
                index,
                size: self.len(),
            });
        }
        let shard = self.bounds.partition_point(|&b| b <= index) - 1;
        Ok((shard, index - self.bounds[shard]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_eight_over_two() {
        let p = Partition::plan(8, 2).unwrap();
        assert_eq!(p.boundaries(), &[0, 4, 8]);
        assert_eq!(p.shard_count(), 2);
        assert_eq!(p.range(1), 4..8);
    }

    #[test]
    fn test_larger_shards_first() {
        let p = Partition::plan(10, 4).unwrap();
        assert_eq!(p.boundaries(), &[0, 3, 6, 8, 10]);
    }

    #[test]
    fn test_plan_laws() {
        for n in 0..40 {
            for shards in 1..7 {
                let p = Partition::plan(n, shards).unwrap();
                assert_eq!(p.len(), n);
                assert_eq!(p.boundaries().len(), shards + 1);
                let sizes: Vec<usize> = (0..shards).map(|s| p.part_size(s)).collect();
                assert_eq!(sizes.iter().sum::<usize>(), n);
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
                assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
                assert_eq!(p, Partition::plan(n, shards).unwrap());
            }
        }
    }

    #[test]
    fn test_zero_shards() {
        assert!(matches!(
            Partition::plan(5, 0),
            Err(Error::InvalidPartition(_))
        ));
    }

    #[test]
    fn test_more_shards_than_elements() {
        let p = Partition::plan(2, 4).unwrap();
        assert_eq!(p.boundaries(), &[0, 1, 2, 2, 2]);
        assert_eq!(p.locate(1).unwrap(), (1, 0));
    }

    #[test]
    fn test_locate() {
        let p = Partition::plan(7, 3).unwrap();
        assert_eq!(p.locate(0).unwrap(), (0, 0));
        assert_eq!(p.locate(3).unwrap(), (1, 0));
        assert_eq!(p.locate(6).unwrap(), (2, 1));
        assert!(matches!(
            p.locate(7),
            Err(Error::IndexOutOfBounds { index: 7, size: 7 })
        ));
    }
}
