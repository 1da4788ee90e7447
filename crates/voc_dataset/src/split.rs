//! Random train/val partitioning over dataset indices.

use crate::dataset::Dataset;
use crate::types::{DatasetResult, VocDatasetError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::marker::PhantomData;
use std::sync::Arc;

/// `(floor(len * ratio), len - floor(len * ratio))`; `ratio` must lie strictly inside (0, 1).
pub fn split_lengths(len: usize, ratio: f64) -> DatasetResult<(usize, usize)> {
    if !ratio.is_finite() || ratio <= 0.0 || ratio >= 1.0 {
        return Err(VocDatasetError::InvalidRatio { ratio });
    }
    let training = ((len as f64 * ratio).floor() as usize).min(len);
    Ok((training, len - training))
}

/// Shuffle `0..len` and cut it after `training_len` indices.
///
/// The two groups are disjoint and together cover every index exactly once.
pub fn random_split<R: Rng + ?Sized>(
    len: usize,
    training_len: usize,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    let validation = indices.split_off(training_len.min(len));
    (indices, validation)
}

/// A view over a shared dataset through a fixed list of indices.
pub struct SubsetDataset<D, I> {
    dataset: Arc<D>,
    indices: Vec<usize>,
    input: PhantomData<fn() -> I>,
}

impl<D, I> SubsetDataset<D, I>
where
    D: Dataset<I>,
{
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self {
            dataset,
            indices,
            input: PhantomData,
        }
    }

    /// Positions in the parent dataset, in subset order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn parent(&self) -> &Arc<D> {
        &self.dataset
    }
}

impl<D, I> Dataset<I> for SubsetDataset<D, I>
where
    D: Dataset<I>,
{
    fn get(&self, index: usize) -> DatasetResult<I> {
        let parent_index = *self
            .indices
            .get(index)
            .ok_or(VocDatasetError::IndexOutOfRange {
                index,
                len: self.indices.len(),
            })?;
        self.dataset.get(parent_index)
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    struct Numbers(usize);

    impl Dataset<usize> for Numbers {
        fn get(&self, index: usize) -> DatasetResult<usize> {
            if index < self.0 {
                Ok(index * 10)
            } else {
                Err(VocDatasetError::IndexOutOfRange { index, len: self.0 })
            }
        }

        fn len(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn lengths_use_floor_and_remainder() {
        assert_eq!(split_lengths(100, 0.8).unwrap(), (80, 20));
        assert_eq!(split_lengths(105, 0.8).unwrap(), (84, 21));
        assert_eq!(split_lengths(3, 0.5).unwrap(), (1, 2));
        assert_eq!(split_lengths(0, 0.8).unwrap(), (0, 0));
        assert_eq!(split_lengths(10, 0.7).unwrap(), (7, 3));
    }

    #[test]
    fn lengths_stay_exact_for_large_datasets() {
        // Past 2^24 single precision can no longer represent every length.
        let len = (1usize << 24) + 3;
        assert_eq!(split_lengths(len, 0.5).unwrap(), (len / 2, len - len / 2));
        assert_eq!(split_lengths(33_554_433, 0.25).unwrap(), (8_388_608, 25_165_825));
    }

    #[test]
    fn ratio_outside_open_interval_fails() {
        for bad in [0.0, 1.0, -0.2, 1.5, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                split_lengths(10, bad),
                Err(VocDatasetError::InvalidRatio { .. })
            ));
        }
    }

    #[test]
    fn split_is_disjoint_and_exhaustive() {
        let mut rng = StdRng::seed_from_u64(7);
        let (train, val) = random_split(105, 84, &mut rng);
        assert_eq!(train.len(), 84);
        assert_eq!(val.len(), 21);
        let train_set: BTreeSet<_> = train.iter().copied().collect();
        let val_set: BTreeSet<_> = val.iter().copied().collect();
        assert!(train_set.is_disjoint(&val_set));
        let all: BTreeSet<_> = train_set.union(&val_set).copied().collect();
        assert_eq!(all, (0..105).collect::<BTreeSet<usize>>());
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let a = random_split(50, 40, &mut StdRng::seed_from_u64(3));
        let b = random_split(50, 40, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn subset_reads_through_parent_indices() {
        let subset: SubsetDataset<_, usize> = SubsetDataset::new(Arc::new(Numbers(5)), vec![4, 0, 2]);
        assert_eq!(subset.len(), 3);
        assert_eq!(subset.get(0).unwrap(), 40);
        assert_eq!(subset.get(2).unwrap(), 20);
        assert!(subset.get(3).is_err());
    }
}
