//! Data sources: mini-batch inputs and constants
//!
//! Neither node ever receives a gradient.

use crate::node::{OpContext, Operation, Sides};
use crate::source::{MiniBatch, MiniBatchListener, MiniBatchSource};
use anyhow::{anyhow, Context, Result};
use strata_core::{Shape, TensorPointer};

/// Streams samples of a [`MiniBatchSource`] into a `[features, max_batch]`
/// tensor, one sample per column. Columns past the batch size are zero.
pub struct InputNode {
    shape: Shape,
    source: Box<dyn MiniBatchSource>,
    sample: Vec<f32>,
    listeners: Vec<Box<dyn MiniBatchListener>>,
}

impl InputNode {
    pub fn new(
        shape: Shape,
        source: Box<dyn MiniBatchSource>,
        listeners: Vec<Box<dyn MiniBatchListener>>,
    ) -> Result<Self> {
        if shape.len() != 2 || shape[0] != source.features() {
            return Err(anyhow!(
                "input shape {:?} does not hold {}-feature samples",
                shape.as_slice(),
                source.features()
            ));
        }
        let sample = vec![0.0; source.features()];
        Ok(Self {
            shape,
            source,
            sample,
            listeners,
        })
    }

    /// Samples in the underlying data set
    pub fn sample_count(&self) -> usize {
        self.source.sample_count()
    }

    /// Column capacity of one batch
    pub fn max_batch(&self) -> usize {
        self.shape[1]
    }

    /// Register a listener for mini-batch notifications
    pub fn add_listener(&mut self, listener: Box<dyn MiniBatchListener>) {
        self.listeners.push(listener);
    }
}

impl Operation for InputNode {
    fn name(&self) -> &'static str {
        "input"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let out = ctx.allocate(&self.shape)?;
        let batch = ctx.batch;
        let cols = self.shape[1];
        let first = batch.index * batch.capacity;
        let Self { source, sample, .. } = self;

        ctx.write(out, |_, dst| {
            dst.fill(0.0);
            for col in 0..batch.size.min(cols) {
                source
                    .read_sample(first + col, sample)
                    .with_context(|| format!("reading sample {}", first + col))?;
                for (feature, &value) in sample.iter().enumerate() {
                    dst[feature * cols + col] = value;
                }
            }
            Ok(())
        })?;

        Ok(out)
    }

    fn backward_memory(&self, _sides: Sides) -> Vec<Shape> {
        Vec::new()
    }

    fn requires_backward_value(&self, _sides: Sides) -> bool {
        false
    }

    fn on_mini_batch(&mut self, batch: MiniBatch) {
        for listener in &mut self.listeners {
            listener.on_mini_batch(batch.index, batch.size);
        }
    }
}

/// Fixed values copied into the arena every step
pub struct ConstantNode {
    shape: Shape,
    values: Vec<f32>,
}

impl ConstantNode {
    pub fn new(shape: Shape, values: Vec<f32>) -> Self {
        Self { shape, values }
    }
}

impl Operation for ConstantNode {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let out = ctx.allocate(&self.shape)?;
        ctx.write(out, |_, dst| {
            dst.copy_from_slice(&self.values);
            Ok(())
        })?;
        Ok(out)
    }

    fn backward_memory(&self, _sides: Sides) -> Vec<Shape> {
        Vec::new()
    }

    fn requires_backward_value(&self, _sides: Sides) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CostMode;
    use crate::source::InMemorySource;
    use std::cell::RefCell;
    use std::rc::Rc;
    use strata_core::{shape, ArenaCapacity, MemoryArena};

    fn source() -> Box<dyn MiniBatchSource> {
        // Three 2-feature samples
        Box::new(InMemorySource::new(2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap())
    }

    #[test]
    fn test_input_fills_columns() -> Result<()> {
        let mut node = InputNode::new(shape![2, 2], source(), Vec::new())?;
        let mut arena = MemoryArena::new(ArenaCapacity::new(4, 0));
        let mut ctx = OpContext::forward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            MiniBatch::new(0, 2, 2),
            CostMode::Training,
        );
        let out = node.forward(&mut ctx)?;
        // Row-major [features, batch]: samples are columns
        assert_eq!(ctx.slice(out)?, &[1.0, 3.0, 2.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_input_zero_pads_partial_batch() -> Result<()> {
        let mut node = InputNode::new(shape![2, 2], source(), Vec::new())?;
        let mut arena = MemoryArena::new(ArenaCapacity::new(4, 0));
        let mut ctx = OpContext::forward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            MiniBatch::new(1, 1, 2),
            CostMode::Training,
        );
        let out = node.forward(&mut ctx)?;
        assert_eq!(ctx.slice(out)?, &[5.0, 0.0, 6.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_input_rejects_feature_mismatch() {
        assert!(InputNode::new(shape![3, 2], source(), Vec::new()).is_err());
    }

    #[test]
    fn test_input_notifies_listeners() -> Result<()> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut node = InputNode::new(shape![2, 2], source(), Vec::new())?;
        node.add_listener(Box::new(move |index: usize, size: usize| {
            sink.borrow_mut().push((index, size))
        }));

        node.on_mini_batch(MiniBatch::new(1, 1, 2));
        assert_eq!(*seen.borrow(), vec![(1, 1)]);
        Ok(())
    }

    #[test]
    fn test_constant_copies_values() -> Result<()> {
        let mut node = ConstantNode::new(shape![3], vec![1.0, 2.0, 3.0]);
        assert!(!node.requires_backward_value(Sides::new(true, true)));

        let mut arena = MemoryArena::new(ArenaCapacity::new(3, 0));
        let mut ctx = OpContext::forward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            MiniBatch::single(),
            CostMode::Training,
        );
        let out = node.forward(&mut ctx)?;
        assert_eq!(ctx.slice(out)?, &[1.0, 2.0, 3.0]);
        Ok(())
    }
}
