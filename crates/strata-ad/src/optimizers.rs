//! Gradient optimizers applied by trainable variables.
//!
//! A variable owns its weights and one boxed [`GradientOptimizer`]. During
//! the backward pass the variable hands the optimizer its accumulated
//! gradient together with scratch buffers carved from the current backward
//! slot. Persistent optimizer state (velocity, moments) is allocated once in
//! [`GradientOptimizer::prepare`] when the graph is compiled, never in the
//! training loop.
//!
//! # Optimizers
//!
//! - **SGD**: Stochastic Gradient Descent with optional momentum, Nesterov
//!   momentum and weight decay
//! - **Adam**: Adaptive Moment Estimation with bias correction
//! - **AMSGrad**: Adam keeping the running maximum of the second moment
//!
//! Gradients arrive summed over the samples of a mini-batch. Every optimizer
//! listens for mini-batch notifications and divides by the actual batch
//! size, so a partial final batch is averaged over its real samples.
//!
//! # Example
//!
//! ```rust
//! use strata_ad::optimizers::{Adam, GradientOptimizer, OptimizerConfig};
//!
//! let mut adam = Adam::new(OptimizerConfig::adam().beta1(0.8));
//! adam.prepare(&[2]);
//!
//! let mut weights = [1.0f32, -1.0];
//! let mut scratch = vec![0.0f32; 2];
//! adam.optimize(&mut weights, &[2], &[0.5, -0.5], 0.1, &mut [scratch.as_mut_slice()]).unwrap();
//! assert!(weights[0] < 1.0 && weights[1] > -1.0);
//! ```

use crate::source::MiniBatchListener;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use strata_core::shape::stride;
use strata_core::Shape;

/// Configuration for optimizers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Momentum coefficient (for SGD)
    pub momentum: f64,
    /// Weight decay (L2 regularization)
    pub weight_decay: f64,
    /// Beta1 for Adam-family optimizers
    pub beta1: f64,
    /// Beta2 for Adam-family optimizers
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub epsilon: f64,
    /// Nesterov momentum (for SGD)
    pub nesterov: bool,
    /// Dampening for momentum (for SGD)
    pub dampening: f64,
    /// Keep the running maximum of the second moment (for Adam)
    pub amsgrad: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::sgd()
    }
}

impl OptimizerConfig {
    /// Create SGD configuration
    pub fn sgd() -> Self {
        Self {
            momentum: 0.0,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            nesterov: false,
            dampening: 0.0,
            amsgrad: false,
        }
    }

    /// Create Adam configuration
    pub fn adam() -> Self {
        Self {
            momentum: 0.0,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            nesterov: false,
            dampening: 0.0,
            amsgrad: false,
        }
    }

    /// Create AMSGrad configuration
    pub fn amsgrad() -> Self {
        Self {
            amsgrad: true,
            ..Self::adam()
        }
    }

    /// Set momentum
    pub fn momentum(mut self, m: f64) -> Self {
        self.momentum = m;
        self
    }

    /// Set weight decay
    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Set beta1
    pub fn beta1(mut self, b1: f64) -> Self {
        self.beta1 = b1;
        self
    }

    /// Set beta2
    pub fn beta2(mut self, b2: f64) -> Self {
        self.beta2 = b2;
        self
    }

    /// Set epsilon
    pub fn epsilon(mut self, eps: f64) -> Self {
        self.epsilon = eps;
        self
    }

    /// Enable Nesterov momentum
    pub fn nesterov(mut self) -> Self {
        self.nesterov = true;
        self
    }

    /// Set dampening
    pub fn dampening(mut self, d: f64) -> Self {
        self.dampening = d;
        self
    }
}

/// Update rule of a trainable variable
pub trait GradientOptimizer: MiniBatchListener {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Allocate persistent state for a variable of `shape`
    fn prepare(&mut self, shape: &[usize]);

    /// Scratch tensors `optimize` needs, allocated from the backward arena
    fn required_scratch_shapes(&self, shape: &[usize]) -> Vec<Shape>;

    /// Update `data` in place from the batch-summed `gradient`
    ///
    /// `scratch` holds one buffer per entry of
    /// [`required_scratch_shapes`](Self::required_scratch_shapes).
    fn optimize(
        &mut self,
        data: &mut [f32],
        shape: &[usize],
        gradient: &[f32],
        learning_rate: f32,
        scratch: &mut [&mut [f32]],
    ) -> Result<()>;

    /// Forget accumulated state
    fn reset(&mut self);

    /// Number of updates applied
    fn num_steps(&self) -> usize;
}

fn check_buffers(
    name: &str,
    data: &[f32],
    shape: &[usize],
    gradient: &[f32],
    state: usize,
) -> Result<()> {
    let expected = stride(shape);
    if data.len() != expected || gradient.len() != expected {
        return Err(anyhow!(
            "{}: shape {:?} needs {} elements, got data {} and gradient {}",
            name,
            shape,
            expected,
            data.len(),
            gradient.len()
        ));
    }
    if state != expected {
        return Err(anyhow!(
            "{}: state holds {} elements but the variable has {}; call prepare first",
            name,
            state,
            expected
        ));
    }
    Ok(())
}

/// Stochastic Gradient Descent optimizer
#[derive(Debug, Clone)]
pub struct Sgd {
    config: OptimizerConfig,
    velocity: Vec<f32>,
    batch_size: usize,
    step_count: usize,
}

impl Sgd {
    /// Create new SGD optimizer
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            velocity: Vec::new(),
            batch_size: 1,
            step_count: 0,
        }
    }

    fn uses_momentum(&self) -> bool {
        self.config.momentum > 0.0
    }
}

impl MiniBatchListener for Sgd {
    fn on_mini_batch(&mut self, _batch_index: usize, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }
}

impl GradientOptimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn prepare(&mut self, shape: &[usize]) {
        if self.uses_momentum() {
            self.velocity = vec![0.0; stride(shape)];
        }
    }

    fn required_scratch_shapes(&self, _shape: &[usize]) -> Vec<Shape> {
        Vec::new()
    }

    fn optimize(
        &mut self,
        data: &mut [f32],
        shape: &[usize],
        gradient: &[f32],
        learning_rate: f32,
        _scratch: &mut [&mut [f32]],
    ) -> Result<()> {
        let state = if self.uses_momentum() {
            self.velocity.len()
        } else {
            data.len()
        };
        check_buffers(self.name(), data, shape, gradient, state)?;

        let scale = 1.0 / self.batch_size as f32;
        let momentum = self.config.momentum as f32;
        let weight_decay = self.config.weight_decay as f32;
        let dampening = self.config.dampening as f32;
        let first = self.step_count == 0;

        for (i, (w, &g)) in data.iter_mut().zip(gradient).enumerate() {
            let mut grad = g * scale + weight_decay * *w;

            if self.uses_momentum() {
                let v = &mut self.velocity[i];
                // v = momentum * v + (1 - dampening) * grad
                *v = if first {
                    grad
                } else {
                    momentum * *v + (1.0 - dampening) * grad
                };
                grad = if self.config.nesterov {
                    grad + momentum * *v
                } else {
                    *v
                };
            }

            *w -= learning_rate * grad;
        }

        self.step_count += 1;
        Ok(())
    }

    fn reset(&mut self) {
        self.velocity.fill(0.0);
        self.step_count = 0;
    }

    fn num_steps(&self) -> usize {
        self.step_count
    }
}

/// Adam optimizer (Adaptive Moment Estimation), optionally AMSGrad
#[derive(Debug, Clone)]
pub struct Adam {
    config: OptimizerConfig,
    m: Vec<f32>,     // First moment estimate
    v: Vec<f32>,     // Second moment estimate
    v_max: Vec<f32>, // Running maximum of v (AMSGrad only)
    batch_size: usize,
    step_count: usize,
}

impl Adam {
    /// Create new Adam optimizer
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            m: Vec::new(),
            v: Vec::new(),
            v_max: Vec::new(),
            batch_size: 1,
            step_count: 0,
        }
    }
}

impl MiniBatchListener for Adam {
    fn on_mini_batch(&mut self, _batch_index: usize, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }
}

impl GradientOptimizer for Adam {
    fn name(&self) -> &'static str {
        if self.config.amsgrad {
            "amsgrad"
        } else {
            "adam"
        }
    }

    fn prepare(&mut self, shape: &[usize]) {
        let len = stride(shape);
        self.m = vec![0.0; len];
        self.v = vec![0.0; len];
        if self.config.amsgrad {
            self.v_max = vec![0.0; len];
        }
    }

    fn required_scratch_shapes(&self, shape: &[usize]) -> Vec<Shape> {
        vec![Shape::from_slice(shape)]
    }

    fn optimize(
        &mut self,
        data: &mut [f32],
        shape: &[usize],
        gradient: &[f32],
        learning_rate: f32,
        scratch: &mut [&mut [f32]],
    ) -> Result<()> {
        check_buffers(self.name(), data, shape, gradient, self.m.len())?;
        let [grad] = scratch else {
            return Err(anyhow!(
                "{}: expected one scratch buffer, got {}",
                self.name(),
                scratch.len()
            ));
        };
        if grad.len() != data.len() {
            return Err(anyhow!(
                "{}: scratch holds {} elements, variable has {}",
                self.name(),
                grad.len(),
                data.len()
            ));
        }

        // Rescaled and decayed gradient
        let scale = 1.0 / self.batch_size as f32;
        let weight_decay = self.config.weight_decay as f32;
        for ((g, &raw), &w) in grad.iter_mut().zip(gradient).zip(data.iter()) {
            *g = raw * scale + weight_decay * w;
        }

        self.step_count += 1;

        let beta1 = self.config.beta1 as f32;
        let beta2 = self.config.beta2 as f32;
        let epsilon = self.config.epsilon as f32;
        // Bias correction
        let beta1_t = 1.0 - self.config.beta1.powi(self.step_count as i32) as f32;
        let beta2_t = 1.0 - self.config.beta2.powi(self.step_count as i32) as f32;

        for i in 0..data.len() {
            let g = grad[i];
            self.m[i] = beta1 * self.m[i] + (1.0 - beta1) * g;
            self.v[i] = beta2 * self.v[i] + (1.0 - beta2) * g * g;

            let second = if self.config.amsgrad {
                self.v_max[i] = self.v_max[i].max(self.v[i]);
                self.v_max[i]
            } else {
                self.v[i]
            };

            let m_hat = self.m[i] / beta1_t;
            let v_hat = second / beta2_t;
            data[i] -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
        }

        Ok(())
    }

    fn reset(&mut self) {
        self.m.fill(0.0);
        self.v.fill(0.0);
        self.v_max.fill(0.0);
        self.step_count = 0;
    }

    fn num_steps(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_basic() -> Result<()> {
        let mut optimizer = Sgd::new(OptimizerConfig::sgd());
        optimizer.prepare(&[3]);

        let mut params = [1.0f32, 2.0, 3.0];
        optimizer.optimize(&mut params, &[3], &[0.1, 0.2, 0.3], 0.1, &mut [])?;

        // params = params - lr * grads
        assert!((params[0] - 0.99).abs() < 1e-6);
        assert!((params[1] - 1.98).abs() < 1e-6);
        assert!((params[2] - 2.97).abs() < 1e-6);
        assert_eq!(optimizer.num_steps(), 1);
        Ok(())
    }

    #[test]
    fn test_sgd_averages_over_batch() -> Result<()> {
        let mut optimizer = Sgd::new(OptimizerConfig::sgd());
        optimizer.prepare(&[1]);
        optimizer.on_mini_batch(3, 4);

        let mut params = [0.0f32];
        optimizer.optimize(&mut params, &[1], &[8.0], 1.0, &mut [])?;
        assert_eq!(params, [-2.0]);
        Ok(())
    }

    #[test]
    fn test_sgd_momentum() -> Result<()> {
        let mut optimizer = Sgd::new(OptimizerConfig::sgd().momentum(0.5));
        optimizer.prepare(&[1]);

        let mut params = [0.0f32];
        optimizer.optimize(&mut params, &[1], &[1.0], 1.0, &mut [])?;
        assert_eq!(params, [-1.0]);
        // v = 0.5 * 1 + 1 = 1.5
        optimizer.optimize(&mut params, &[1], &[1.0], 1.0, &mut [])?;
        assert_eq!(params, [-2.5]);

        optimizer.reset();
        assert_eq!(optimizer.num_steps(), 0);
        Ok(())
    }

    #[test]
    fn test_sgd_weight_decay() -> Result<()> {
        let mut optimizer = Sgd::new(OptimizerConfig::sgd().weight_decay(0.5));
        optimizer.prepare(&[1]);
        let mut params = [2.0f32];
        optimizer.optimize(&mut params, &[1], &[0.0], 0.1, &mut [])?;
        assert!((params[0] - 1.9).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() -> Result<()> {
        let mut optimizer = Adam::new(OptimizerConfig::adam());
        optimizer.prepare(&[2]);
        let mut params = [1.0f32, 1.0];
        let mut scratch = vec![0.0f32; 2];

        optimizer.optimize(&mut params, &[2], &[3.0, -0.2], 0.01, &mut [scratch.as_mut_slice()])?;

        // With bias correction the first update is lr * sign(g)
        assert!((params[0] - 0.99).abs() < 1e-4);
        assert!((params[1] - 1.01).abs() < 1e-4);
        assert_eq!(scratch, vec![3.0, -0.2]);
        Ok(())
    }

    #[test]
    fn test_amsgrad_keeps_second_moment_maximum() -> Result<()> {
        let mut optimizer = Adam::new(OptimizerConfig::amsgrad());
        assert_eq!(optimizer.name(), "amsgrad");
        optimizer.prepare(&[1]);
        let mut params = [0.0f32];
        let mut scratch = vec![0.0f32; 1];

        optimizer.optimize(&mut params, &[1], &[10.0], 0.1, &mut [scratch.as_mut_slice()])?;
        let peak = optimizer.v_max[0];
        optimizer.optimize(&mut params, &[1], &[0.0], 0.1, &mut [scratch.as_mut_slice()])?;
        assert!(optimizer.v_max[0] >= peak * 0.999);
        assert!(optimizer.v[0] < optimizer.v_max[0]);
        Ok(())
    }

    #[test]
    fn test_unprepared_optimizer_is_rejected() {
        let mut optimizer = Adam::new(OptimizerConfig::adam());
        let mut params = [0.0f32; 2];
        let mut scratch = vec![0.0f32; 2];
        let err = optimizer
            .optimize(&mut params, &[2], &[1.0, 1.0], 0.1, &mut [scratch.as_mut_slice()])
            .unwrap_err();
        assert!(err.to_string().contains("prepare"));
    }

    #[test]
    fn test_config_serde_round_trip() -> Result<()> {
        let config = OptimizerConfig::sgd().momentum(0.9).nesterov();
        let json = serde_json::to_string(&config)?;
        let back: OptimizerConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);
        Ok(())
    }
}
