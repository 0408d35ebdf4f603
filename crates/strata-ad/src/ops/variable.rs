//! Trainable variables and their initializers

use crate::node::{OpContext, Operation, Sides};
use crate::optimizers::GradientOptimizer;
use crate::source::MiniBatch;
use anyhow::{anyhow, Context, Result};
use scirs2_core::random::{Rng, SeedableRng, StdRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strata_core::shape::{matrix_dims, stride};
use strata_core::{MemoryArena, Shape, TensorPointer};

/// How a variable's weights are filled when the graph is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    /// All zeros
    Zeros,
    /// Every element set to the value
    Constant(f32),
    /// Explicit values in row-major order
    Values(Vec<f32>),
    /// Uniform in `[low, high)`
    Uniform { low: f32, high: f32, seed: u64 },
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`
    XavierUniform { seed: u64 },
    /// Normal with standard deviation `sqrt(2 / fan_in)`
    HeNormal { seed: u64 },
}

impl Initializer {
    /// Produce the initial weights for `shape`
    ///
    /// For matrices `[rows, cols]` the fan-in is `cols` and the fan-out is
    /// `rows`, matching `y = W x` with samples as columns.
    pub fn materialize(&self, shape: &[usize]) -> Result<Vec<f32>> {
        let len = stride(shape);
        let values = match self {
            Initializer::Zeros => vec![0.0; len],
            Initializer::Constant(value) => vec![*value; len],
            Initializer::Values(values) => {
                if values.len() != len {
                    return Err(anyhow!(
                        "{} initial values supplied for shape {:?} ({} elements)",
                        values.len(),
                        shape,
                        len
                    ));
                }
                values.clone()
            }
            Initializer::Uniform { low, high, seed } => {
                if high < low {
                    return Err(anyhow!("uniform range [{}, {}) is empty", low, high));
                }
                uniform(len, *low as f64, *high as f64, *seed)
            }
            Initializer::XavierUniform { seed } => {
                let (fan_out, fan_in) = matrix_dims(shape)?;
                let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                uniform(len, -limit, limit, *seed)
            }
            Initializer::HeNormal { seed } => {
                let (_, fan_in) = matrix_dims(shape)?;
                let std = (2.0 / fan_in.max(1) as f64).sqrt();
                let mut rng = StdRng::seed_from_u64(*seed);
                (0..len)
                    .map(|_| {
                        // Box-Muller
                        let u1 = rng.random::<f64>().max(f64::MIN_POSITIVE);
                        let u2 = rng.random::<f64>();
                        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                        (z * std) as f32
                    })
                    .collect()
            }
        };
        Ok(values)
    }
}

fn uniform(len: usize, low: f64, high: f64, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| (low + (high - low) * rng.random::<f64>()) as f32)
        .collect()
}

/// Trainable leaf owning its weights and optimizer
///
/// The weights live outside the arena for the lifetime of the graph. On the
/// backward pass the accumulated gradient is handed to the optimizer
/// together with scratch carved from the current backward slot.
pub struct VariableNode {
    shape: Shape,
    data: Vec<f32>,
    optimizer: Box<dyn GradientOptimizer>,
    scratch_lens: SmallVec<[usize; 4]>,
}

impl VariableNode {
    /// Wrap `data` and prepare the optimizer for it
    pub fn new(
        shape: Shape,
        data: Vec<f32>,
        mut optimizer: Box<dyn GradientOptimizer>,
    ) -> Result<Self> {
        if data.len() != stride(&shape) {
            return Err(anyhow!(
                "variable of shape {:?} needs {} values, got {}",
                shape.as_slice(),
                stride(&shape),
                data.len()
            ));
        }
        optimizer.prepare(&shape);
        let scratch_lens = optimizer
            .required_scratch_shapes(&shape)
            .iter()
            .map(|s| stride(s))
            .collect();
        Ok(Self {
            shape,
            data,
            optimizer,
            scratch_lens,
        })
    }

    /// Current weights
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable weights, for checkpoint restore and finite differences
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn optimizer(&self) -> &dyn GradientOptimizer {
        self.optimizer.as_ref()
    }

    /// Run the optimizer on the gradient behind `gradient`
    ///
    /// Allocates one block in the current backward slot and splits it into
    /// the optimizer's scratch buffers. The gradient must have been
    /// allocated before the block.
    pub fn apply_gradient(
        &mut self,
        arena: &mut MemoryArena,
        gradient: TensorPointer,
        learning_rate: f32,
    ) -> Result<()> {
        let total = self.scratch_lens.iter().sum();
        let block = arena
            .allocate_backward(total)
            .context("allocating optimizer scratch")?;
        let (view, block) = arena.split_for_write(block)?;
        let grad = view.slice(gradient)?;

        let mut rest = block;
        let mut scratch: SmallVec<[&mut [f32]; 4]> = SmallVec::new();
        for &len in &self.scratch_lens {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            scratch.push(head);
            rest = tail;
        }

        self.optimizer
            .optimize(&mut self.data, &self.shape, grad, learning_rate, &mut scratch)
            .with_context(|| format!("{} update", self.optimizer.name()))
    }
}

impl Operation for VariableNode {
    fn name(&self) -> &'static str {
        "variable"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let out = ctx.allocate(&self.shape)?;
        ctx.write(out, |_, dst| {
            dst.copy_from_slice(&self.data);
            Ok(())
        })?;
        Ok(out)
    }

    fn backward_memory(&self, _sides: Sides) -> Vec<Shape> {
        self.optimizer.required_scratch_shapes(&self.shape)
    }

    fn requires_backward_value(&self, _sides: Sides) -> bool {
        true
    }

    fn on_mini_batch(&mut self, batch: MiniBatch) {
        self.optimizer.on_mini_batch(batch.index, batch.size);
    }
}
