//! Gradient checking utilities
//!
//! Verifies the gradients a [`Session`] computes for a variable against
//! finite differences of the full-pass batch loss. Useful when adding a new
//! operator: if its backward rule is wrong, every variable upstream of it
//! fails the check.
//!
//! # Finite Difference Methods
//!
//! - **Central difference**: `f'(x) ≈ [f(x+h) - f(x-h)] / (2h)` (more accurate)
//! - **Forward difference**: `f'(x) ≈ [f(x+h) - f(x)] / h` (faster)
//!
//! The arena is single precision, so the step size is much larger than in
//! a double precision check.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_ad::gradcheck::{check_variable_gradient, GradCheckConfig};
//!
//! let result = check_variable_gradient(&mut session, weights, 0, &GradCheckConfig::default())?;
//! assert!(result.passed, "{}", result);
//! ```

use crate::node::NodeId;
use crate::scheduler::Session;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Gradient checking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradCheckConfig {
    /// Step size for finite differences (default: 1e-2)
    pub epsilon: f32,

    /// Relative tolerance for gradient comparison (default: 1e-2)
    pub rtol: f32,

    /// Absolute tolerance for gradient comparison (default: 1e-3)
    pub atol: f32,

    /// Use central difference (more accurate but 2x slower)
    pub use_central_diff: bool,
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-2,
            rtol: 1e-2,
            atol: 1e-3,
            use_central_diff: true,
        }
    }
}

impl GradCheckConfig {
    /// Set step size
    pub fn epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Set tolerances
    pub fn tolerances(mut self, rtol: f32, atol: f32) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    /// Use forward differences
    pub fn forward_diff(mut self) -> Self {
        self.use_central_diff = false;
        self
    }
}

/// Result of gradient checking
#[derive(Debug, Clone)]
pub struct GradCheckResult {
    /// Gradient reported by the backward pass
    pub analytical: Vec<f32>,

    /// Finite difference estimate
    pub numerical: Vec<f32>,

    /// Maximum absolute difference between analytical and numerical gradients
    pub max_abs_diff: f32,

    /// Maximum relative difference
    pub max_rel_diff: f32,

    /// Whether the gradient check passed
    pub passed: bool,

    /// Number of elements that failed the check
    pub num_failures: usize,
}

impl fmt::Display for GradCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gradient Check:")?;
        writeln!(f, "  Passed: {}", self.passed)?;
        writeln!(
            f,
            "  Failures: {}/{}",
            self.num_failures,
            self.analytical.len()
        )?;
        writeln!(f, "  Max absolute difference: {:.2e}", self.max_abs_diff)?;
        write!(f, "  Max relative difference: {:.2e}", self.max_rel_diff)
    }
}

/// Check the gradient of `variable` on mini-batch `batch`
///
/// Runs one gradient step without updating any variable, then perturbs each
/// weight in turn and re-evaluates the batch loss. Weights are restored
/// after every evaluation.
pub fn check_variable_gradient(
    session: &mut Session,
    variable: NodeId,
    batch: usize,
    config: &GradCheckConfig,
) -> Result<GradCheckResult> {
    if config.epsilon <= 0.0 {
        return Err(anyhow!("epsilon must be positive, got {}", config.epsilon));
    }

    session.compute_gradients(batch)?;
    let analytical = session.recorded_gradient(variable)?.to_vec();
    let numerical = numerical_gradient(session, variable, batch, config)?;

    Ok(compare_gradients(analytical, numerical, config))
}

fn numerical_gradient(
    session: &mut Session,
    variable: NodeId,
    batch: usize,
    config: &GradCheckConfig,
) -> Result<Vec<f32>> {
    let h = config.epsilon;
    let len = session.variable_data(variable)?.len();
    let base = if config.use_central_diff {
        None
    } else {
        Some(session.evaluate_batch(batch)?)
    };

    let mut numerical = Vec::with_capacity(len);
    for i in 0..len {
        let plus = perturbed_loss(session, variable, batch, i, h)?;
        let estimate = match base {
            None => {
                let minus = perturbed_loss(session, variable, batch, i, -h)?;
                (plus - minus) / (2.0 * h)
            }
            Some(base) => (plus - base) / h,
        };
        numerical.push(estimate);
    }
    Ok(numerical)
}

/// Batch loss with weight `i` shifted by `delta`
fn perturbed_loss(
    session: &mut Session,
    variable: NodeId,
    batch: usize,
    i: usize,
    delta: f32,
) -> Result<f32> {
    let original = session.variable_data(variable)?[i];
    session.variable_data_mut(variable)?[i] = original + delta;
    let loss = session.evaluate_batch(batch);
    session.variable_data_mut(variable)?[i] = original;
    loss
}

fn compare_gradients(
    analytical: Vec<f32>,
    numerical: Vec<f32>,
    config: &GradCheckConfig,
) -> GradCheckResult {
    let mut max_abs_diff = 0.0f32;
    let mut max_rel_diff = 0.0f32;
    let mut num_failures = 0;

    for (idx, (&a, &n)) in analytical.iter().zip(&numerical).enumerate() {
        let abs_diff = (a - n).abs();
        let rel_diff = if n.abs() > f32::EPSILON {
            abs_diff / n.abs()
        } else {
            abs_diff
        };
        max_abs_diff = max_abs_diff.max(abs_diff);
        max_rel_diff = max_rel_diff.max(rel_diff);

        if abs_diff > config.atol && rel_diff > config.rtol {
            num_failures += 1;
            debug!(idx, analytical = a, numerical = n, abs_diff, rel_diff, "gradient mismatch");
        }
    }

    GradCheckResult {
        analytical,
        numerical,
        max_abs_diff,
        max_rel_diff,
        passed: num_failures == 0,
        num_failures,
    }
}
