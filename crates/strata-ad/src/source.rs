//! Mini-batch sources and notification listeners
//!
//! Input nodes read samples column by column from a [`MiniBatchSource`].
//! Before each step the session tells every interested party which batch is
//! about to run and how many samples it really holds, so a partial final
//! batch can be masked and rescaled correctly.

use anyhow::{anyhow, Result};

/// One step's slice of the data set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniBatch {
    /// Zero-based batch index within the epoch
    pub index: usize,
    /// Samples actually present
    pub size: usize,
    /// Column capacity of the input tensors
    pub capacity: usize,
}

impl MiniBatch {
    pub fn new(index: usize, size: usize, capacity: usize) -> Self {
        Self {
            index,
            size,
            capacity,
        }
    }

    /// The batch used by graphs without inputs: one sample, every column valid
    pub fn single() -> Self {
        Self::new(0, 1, 1)
    }

    /// Fewer samples than columns
    pub fn is_partial(&self) -> bool {
        self.size < self.capacity
    }

    /// Number of leading columns of a `cols`-wide tensor holding real samples
    pub fn valid_columns(&self, cols: usize) -> usize {
        if self.is_partial() {
            self.size.min(cols)
        } else {
            cols
        }
    }
}

/// Receives `(batch_index, actual_batch_size)` once per step
pub trait MiniBatchListener {
    fn on_mini_batch(&mut self, batch_index: usize, batch_size: usize);
}

impl<F: FnMut(usize, usize)> MiniBatchListener for F {
    fn on_mini_batch(&mut self, batch_index: usize, batch_size: usize) {
        self(batch_index, batch_size)
    }
}

/// Receives `(epoch_index, aggregate_loss)` after each epoch
pub trait EpochListener {
    fn on_epoch(&mut self, epoch: usize, aggregate_loss: f32);
}

impl<F: FnMut(usize, f32)> EpochListener for F {
    fn on_epoch(&mut self, epoch: usize, aggregate_loss: f32) {
        self(epoch, aggregate_loss)
    }
}

/// Provider of fixed-width samples
pub trait MiniBatchSource {
    /// Elements per sample
    fn features(&self) -> usize;

    /// Samples in the data set
    fn sample_count(&self) -> usize;

    /// Copy sample `index` into `dest` (length `features()`)
    fn read_sample(&mut self, index: usize, dest: &mut [f32]) -> Result<()>;
}

/// Samples held in a contiguous sample-major buffer
#[derive(Debug, Clone)]
pub struct InMemorySource {
    features: usize,
    data: Vec<f32>,
}

impl InMemorySource {
    /// Wrap `data`, whose length must be a multiple of `features`
    pub fn new(features: usize, data: Vec<f32>) -> Result<Self> {
        if features == 0 {
            return Err(anyhow!("a source needs at least one feature per sample"));
        }
        if data.len() % features != 0 {
            return Err(anyhow!(
                "source length {} is not a multiple of {} features",
                data.len(),
                features
            ));
        }
        Ok(Self { features, data })
    }

    /// One-hot encode `labels` into `classes`-wide samples
    pub fn one_hot(labels: &[usize], classes: usize) -> Result<Self> {
        let mut data = vec![0.0; labels.len() * classes];
        for (i, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(anyhow!("label {} is out of range for {} classes", label, classes));
            }
            data[i * classes + label] = 1.0;
        }
        Self::new(classes, data)
    }

    /// Sample `index` as a slice
    pub fn sample(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.features)?;
        self.data.get(start..start + self.features)
    }
}

impl MiniBatchSource for InMemorySource {
    fn features(&self) -> usize {
        self.features
    }

    fn sample_count(&self) -> usize {
        self.data.len() / self.features
    }

    fn read_sample(&mut self, index: usize, dest: &mut [f32]) -> Result<()> {
        let count = self.sample_count();
        let sample = self
            .sample(index)
            .ok_or_else(|| anyhow!("sample {} is out of range ({} samples)", index, count))?;
        if dest.len() != sample.len() {
            return Err(anyhow!(
                "destination holds {} elements, sample has {}",
                dest.len(),
                sample.len()
            ));
        }
        dest.copy_from_slice(sample);
        Ok(())
    }
}
