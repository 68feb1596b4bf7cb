//! Batch sampling over a file-backed partition.
//!
//! The train partition is an infinite logical stream: exhaustion reshuffles
//! and continues, so full batches always come back. The validate and test
//! partitions keep their file order and surface [`RunError::ExhaustedPartition`]
//! when a draw overruns the remaining examples.

use std::fmt;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::data::MatrixFile;
use crate::error::{Result, RunError};

/// One of the three data splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Validate,
    Test,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Validate => "validate",
            Partition::Test => "test",
        }
    }

    /// Per-partition seed derived from the run seed, so shuffle
    /// reproducibility does not depend on construction order.
    fn derive_seed(&self, run_seed: u64) -> u64 {
        let offset = match self {
            Partition::Train => 1,
            Partition::Validate => 2,
            Partition::Test => 3,
        };
        run_seed.wrapping_add(offset)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One draw of examples: inputs `n x len x channels`, targets `n x targets`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array3<f32>,
    pub targets: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sampler bound to one partition file.
pub struct MatrixSampler {
    partition: Partition,
    data: MatrixFile,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl MatrixSampler {
    /// Open a partition file and bind a sampler to it.
    pub fn open(
        path: &Path,
        partition: Partition,
        input_key: &str,
        target_key: &str,
        shuffle: bool,
        run_seed: u64,
    ) -> Result<Self> {
        let data = MatrixFile::open(path, input_key, target_key)?;
        Ok(Self::from_matrix(partition, data, shuffle, run_seed))
    }

    /// Bind a sampler to already-decoded arrays.
    pub fn from_matrix(
        partition: Partition,
        data: MatrixFile,
        shuffle: bool,
        run_seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(partition.derive_seed(run_seed));
        let mut order: Vec<usize> = (0..data.len()).collect();
        if shuffle {
            order.shuffle(&mut rng);
        }
        Self {
            partition,
            data,
            shuffle,
            order,
            cursor: 0,
            rng,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Number of examples in the partition.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// (sequence length, channels, n_targets) of the underlying arrays.
    pub fn input_shape(&self) -> (usize, usize, usize) {
        (
            self.data.inputs.shape()[1],
            self.data.inputs.shape()[2],
            self.data.targets.shape()[1],
        )
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Move the read cursor back to the start without reshuffling. Used
    /// between evaluation passes so every pass sees the same sample.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Draw the next `n` examples.
    ///
    /// Shuffled samplers wrap transparently (reshuffling on wrap) and always
    /// return exactly `n` examples. Non-shuffled samplers return a short
    /// final batch when fewer than `n` remain, and fail once fully consumed.
    pub fn next_batch(&mut self, n: usize) -> Result<Batch> {
        if self.data.is_empty() {
            return Err(RunError::ExhaustedPartition {
                partition: self.partition,
                requested: n,
                remaining: 0,
            });
        }

        let mut indices = Vec::with_capacity(n);
        while indices.len() < n {
            if self.cursor == self.order.len() {
                if self.shuffle {
                    self.order.shuffle(&mut self.rng);
                    self.cursor = 0;
                } else if indices.is_empty() {
                    return Err(RunError::ExhaustedPartition {
                        partition: self.partition,
                        requested: n,
                        remaining: 0,
                    });
                } else {
                    // Short final batch.
                    break;
                }
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }

        Ok(Batch {
            inputs: self.data.inputs.select(Axis(0), &indices),
            targets: self.data.targets.select(Axis(0), &indices),
        })
    }

    /// Draw an evaluation sample of `total` examples in `batch_size` chunks.
    /// Fails with [`RunError::ExhaustedPartition`] when a non-shuffled
    /// partition holds fewer than `total` examples past the cursor.
    pub fn take(&mut self, total: usize, batch_size: usize) -> Result<Vec<Batch>> {
        if !self.shuffle {
            let remaining = self.order.len() - self.cursor;
            if total > remaining {
                return Err(RunError::ExhaustedPartition {
                    partition: self.partition,
                    requested: total,
                    remaining,
                });
            }
        }
        let mut batches = Vec::with_capacity(total.div_ceil(batch_size));
        let mut drawn = 0;
        while drawn < total {
            let n = batch_size.min(total - drawn);
            let batch = self.next_batch(n)?;
            drawn += batch.len();
            batches.push(batch);
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::toy_arrays;
    use pretty_assertions::assert_eq;

    fn sampler(n: usize, shuffle: bool, seed: u64) -> MatrixSampler {
        let (inputs, targets) = toy_arrays(n);
        let data = MatrixFile { inputs, targets };
        let partition = if shuffle {
            Partition::Train
        } else {
            Partition::Validate
        };
        MatrixSampler::from_matrix(partition, data, shuffle, seed)
    }

    #[test]
    fn sequential_sampler_preserves_file_order() {
        let mut s = sampler(6, false, 0);
        let batch = s.next_batch(3).unwrap();
        assert_eq!(batch.targets[[0, 0]], 0.0);
        assert_eq!(batch.targets[[1, 0]], 3.0);
        assert_eq!(batch.targets[[2, 0]], 6.0);
    }

    #[test]
    fn non_shuffled_overrun_returns_short_batch_then_fails() {
        let mut s = sampler(5, false, 0);
        assert_eq!(s.next_batch(3).unwrap().len(), 3);
        // Only two examples left: short final batch.
        assert_eq!(s.next_batch(3).unwrap().len(), 2);
        let err = s.next_batch(1).unwrap_err();
        assert!(matches!(err, RunError::ExhaustedPartition { .. }), "{err}");
    }

    #[test]
    fn shuffled_sampler_wraps_forever() {
        let mut s = sampler(4, true, 7);
        for _ in 0..10 {
            assert_eq!(s.next_batch(3).unwrap().len(), 3);
        }
    }

    #[test]
    fn shuffle_order_is_seed_deterministic() {
        let mut a = sampler(16, true, 42);
        let mut b = sampler(16, true, 42);
        let mut c = sampler(16, true, 43);

        let ba = a.next_batch(16).unwrap();
        let bb = b.next_batch(16).unwrap();
        let bc = c.next_batch(16).unwrap();
        assert_eq!(ba.targets, bb.targets);
        assert_ne!(ba.targets, bc.targets);
    }

    #[test]
    fn take_overrun_fails_without_shuffle_but_wraps_with_shuffle() {
        let mut plain = sampler(4, false, 0);
        let err = plain.take(6, 2).unwrap_err();
        assert!(matches!(
            err,
            RunError::ExhaustedPartition {
                requested: 6,
                remaining: 4,
                ..
            }
        ));

        let mut shuffled = sampler(4, true, 0);
        let batches = shuffled.take(6, 2).unwrap();
        assert_eq!(batches.iter().map(Batch::len).sum::<usize>(), 6);
    }

    #[test]
    fn rewind_repeats_the_same_sample() {
        let mut s = sampler(8, false, 0);
        let first = s.take(6, 3).unwrap();
        s.rewind();
        let second = s.take(6, 3).unwrap();
        assert_eq!(first[0].targets, second[0].targets);
        assert_eq!(first[1].targets, second[1].targets);
    }
}
