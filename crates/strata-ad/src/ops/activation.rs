//! Elementwise activation functions

use crate::node::{OpContext, Operation, Sides};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use strata_core::{Shape, TensorPointer};

/// Supported activation functions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    /// `max(0, x)`
    ReLU,
    /// `x` for positive inputs, `alpha · x` otherwise
    LeakyReLU(f32),
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// `tanh(x)`
    Tanh,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
        }
    }

    /// `dy/dx` given the input `x` and the output `y`
    #[inline]
    pub fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            Activation::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU(alpha) => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::ReLU => write!(f, "relu"),
            Activation::LeakyReLU(alpha) => write!(f, "leaky_relu({})", alpha),
            Activation::Sigmoid => write!(f, "sigmoid"),
            Activation::Tanh => write!(f, "tanh"),
        }
    }
}

pub struct ActivationNode {
    function: Activation,
    shape: Shape,
}

impl ActivationNode {
    pub fn new(function: Activation, shape: Shape) -> Self {
        Self { function, shape }
    }
}

impl Operation for ActivationNode {
    fn name(&self) -> &'static str {
        match self.function {
            Activation::ReLU => "relu",
            Activation::LeakyReLU(_) => "leaky_relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
        }
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let x = ctx.left;
        let f = self.function;
        ctx.produce(&self.shape, |view, dst| {
            for (o, &v) in dst.iter_mut().zip(view.slice(x)?) {
                *o = f.apply(v);
            }
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (x, y, g) = (ctx.left, ctx.output, ctx.upstream);
        let f = self.function;
        ctx.produce(&self.shape, |view, dst| {
            let (x, y, g) = (view.slice(x)?, view.slice(y)?, view.slice(g)?);
            for (i, o) in dst.iter_mut().enumerate() {
                *o = g[i] * f.derivative(x[i], y[i]);
            }
            Ok(())
        })
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        if sides.left {
            vec![self.shape.clone()]
        } else {
            Vec::new()
        }
    }
}
