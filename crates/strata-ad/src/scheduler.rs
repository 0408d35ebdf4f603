//! Execution scheduler
//!
//! A [`Session`] owns a [`CompiledGraph`] and the [`MemoryArena`] sized for
//! it, and runs steps:
//!
//! - **Forward**: layers from the leaves to the terminal. Every node is
//!   evaluated exactly once per step and its output pointer is cached, so a
//!   node shared by several consumers is never recomputed.
//! - **Backward**: layers from the terminal to the leaves. Each node writes a
//!   contribution for every operand that needs one into the current backward
//!   slot; contributions to the same operand are summed in place. Variables
//!   hand their accumulated gradient to their optimizer. Between layers,
//!   pending gradients still sitting in the previous slot are copied forward
//!   and the two slots swap roles.
//!
//! Any failure inside a step poisons the session: the arena and the
//! optimizer state may be half-updated, so further steps are refused.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_ad::{Session, SessionConfig};
//!
//! let mut session = Session::new(graph, SessionConfig::default().learning_rate(0.1))?;
//! for epoch in 0..10 {
//!     let loss = session.train_epoch(epoch)?;
//!     println!("epoch {epoch}: {loss}");
//! }
//! ```

use crate::compiler::CompiledGraph;
use crate::error::GraphError;
use crate::node::{CostMode, NodeId, OpContext};
use crate::ops::ExecKind;
use crate::source::{EpochListener, MiniBatch, MiniBatchListener};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use strata_core::shape::stride;
use strata_core::{ArenaUsage, BackwardRole, MemoryArena, TensorPointer};
use strata_kernels::add_assign;
use tracing::{error, info, trace};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Step size handed to every optimizer
    pub learning_rate: f32,
    /// Keep a copy of every variable gradient during training steps
    pub record_leaf_gradients: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            record_leaf_gradients: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set learning rate
    pub fn learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Record variable gradients on every training step
    pub fn record_leaf_gradients(mut self, record: bool) -> Self {
        self.record_leaf_gradients = record;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    /// Forward, backward and optimizer updates
    Train,
    /// Forward and backward; variables only record their gradient
    Gradients,
    /// Full-pass forward only
    Evaluate,
}

/// How the data set splits into mini-batches
#[derive(Debug, Clone, Copy)]
struct BatchPlan {
    samples: usize,
    capacity: usize,
}

/// Runs training and evaluation steps on a compiled graph
pub struct Session {
    graph: CompiledGraph,
    arena: MemoryArena,
    config: SessionConfig,
    /// Node ids in forward order
    order: Vec<NodeId>,
    /// Node ids per depth, terminal first
    by_depth: Vec<Vec<NodeId>>,
    outputs: Vec<TensorPointer>,
    pending: Vec<TensorPointer>,
    recorded: Vec<Option<Vec<f32>>>,
    plan: Option<BatchPlan>,
    epoch_listeners: Vec<Box<dyn EpochListener>>,
    poisoned: Option<String>,
    steps: usize,
}

impl Session {
    /// Allocate the arena for `graph`
    ///
    /// Every input must stream the same number of samples with the same
    /// batch capacity.
    pub fn new(graph: CompiledGraph, config: SessionConfig) -> Result<Self> {
        let mut plan: Option<BatchPlan> = None;
        for id in graph.inputs() {
            let Some(input) = graph.live(id)?.kind().as_input() else {
                continue;
            };
            let this = BatchPlan {
                samples: input.sample_count(),
                capacity: input.max_batch(),
            };
            match plan {
                None => plan = Some(this),
                Some(p) if p.samples != this.samples || p.capacity != this.capacity => {
                    return Err(GraphError::InvalidGraph(format!(
                        "input {} streams {} samples in batches of {}, expected {} in batches of {}",
                        id, this.samples, this.capacity, p.samples, p.capacity
                    ))
                    .into());
                }
                Some(_) => {}
            }
        }

        let order: Vec<NodeId> = graph.layers().iter().flatten().copied().collect();
        let by_depth: Vec<Vec<NodeId>> = graph.layers().iter().rev().cloned().collect();
        let slots = graph.slots.len();
        let capacity = graph.capacity();
        info!(%capacity, layers = by_depth.len(), "session created");

        Ok(Self {
            arena: MemoryArena::new(capacity),
            graph,
            config,
            order,
            by_depth,
            outputs: vec![TensorPointer::NULL; slots],
            pending: vec![TensorPointer::NULL; slots],
            recorded: vec![None; slots],
            plan,
            epoch_listeners: Vec::new(),
            poisoned: None,
            steps: 0,
        })
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.config.learning_rate = learning_rate;
    }

    pub fn set_cost_mode(&mut self, mode: CostMode) {
        self.graph.set_cost_mode(mode);
    }

    /// The terminal cost skips its scalar during training steps
    pub fn training_mode(&mut self) {
        self.graph.training_mode();
    }

    /// The terminal cost materialises its scalar during training steps
    pub fn full_pass_mode(&mut self) {
        self.graph.full_pass_mode();
    }

    pub fn add_mini_batch_listener(
        &mut self,
        input: NodeId,
        listener: Box<dyn MiniBatchListener>,
    ) -> Result<()> {
        self.graph.add_mini_batch_listener(input, listener)
    }

    /// Called with `(epoch_index, aggregate_loss)` after every epoch
    pub fn add_epoch_listener(&mut self, listener: Box<dyn EpochListener>) {
        self.epoch_listeners.push(listener);
    }

    /// Number of mini-batches per epoch (one for graphs without inputs)
    pub fn batch_count(&self) -> usize {
        match self.plan {
            Some(p) => p.samples.div_ceil(p.capacity),
            None => 1,
        }
    }

    /// Samples per epoch (one for graphs without inputs)
    pub fn sample_count(&self) -> usize {
        self.plan.map_or(1, |p| p.samples)
    }

    /// Completed steps
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// The mini-batch `index` describes
    pub fn mini_batch(&self, index: usize) -> Result<MiniBatch> {
        let count = self.batch_count();
        if index >= count {
            return Err(GraphError::BatchOutOfRange { index, count }.into());
        }
        Ok(match self.plan {
            Some(p) => {
                let size = p.capacity.min(p.samples - index * p.capacity);
                MiniBatch::new(index, size, p.capacity)
            }
            None => MiniBatch::single(),
        })
    }

    /// Forward, backward and optimizer updates on batch `index`
    pub fn train_step(&mut self, index: usize) -> Result<()> {
        self.step(index, StepKind::Train)
    }

    /// Forward and backward on batch `index`, recording variable gradients
    /// without updating any variable
    pub fn compute_gradients(&mut self, index: usize) -> Result<()> {
        self.step(index, StepKind::Gradients)
    }

    /// Full-pass loss of batch `index`
    ///
    /// For a non-cost terminal this is the sum of its outputs, the quantity
    /// its all-ones seed differentiates.
    pub fn evaluate_batch(&mut self, index: usize) -> Result<f32> {
        self.step(index, StepKind::Evaluate)?;
        let output = self.outputs[self.graph.terminal().0];
        Ok(self.arena.slice(output)?.iter().sum())
    }

    /// Loss summed over every batch, divided by the number of samples
    pub fn evaluate_loss(&mut self) -> Result<f32> {
        let mut total = 0.0;
        for index in 0..self.batch_count() {
            total += self.evaluate_batch(index)?;
        }
        Ok(total / self.sample_count().max(1) as f32)
    }

    /// Train on every batch, then report the full-pass loss to the epoch
    /// listeners
    pub fn train_epoch(&mut self, epoch: usize) -> Result<f32> {
        for index in 0..self.batch_count() {
            self.train_step(index)?;
        }
        let loss = self.evaluate_loss()?;
        info!(epoch, loss, "epoch finished");
        for listener in &mut self.epoch_listeners {
            listener.on_epoch(epoch, loss);
        }
        Ok(loss)
    }

    /// Output of `node` in the last step
    pub fn forward_output(&self, node: NodeId) -> Result<&[f32]> {
        self.graph.live(node)?;
        let ptr = self.outputs[node.0];
        if ptr.is_null() {
            return Err(anyhow!("{} produced no output in the last step", node));
        }
        Ok(self.arena.slice(ptr)?)
    }

    /// Output pointers of the last step, indexed by node id
    pub fn forward_pointers(&self) -> &[TensorPointer] {
        &self.outputs
    }

    /// Last recorded gradient of a variable
    pub fn recorded_gradient(&self, variable: NodeId) -> Result<&[f32]> {
        self.graph.live(variable)?;
        self.recorded[variable.0]
            .as_deref()
            .ok_or_else(|| anyhow!("no gradient recorded for {}", variable))
    }

    /// Current weights of a variable
    pub fn variable_data(&self, variable: NodeId) -> Result<&[f32]> {
        let node = self.graph.live(variable)?;
        let actual = node.kind().kind_name();
        node.kind()
            .as_variable()
            .map(|v| v.data())
            .ok_or_else(|| not_a_variable(variable, actual))
    }

    /// Mutable weights of a variable
    pub fn variable_data_mut(&mut self, variable: NodeId) -> Result<&mut [f32]> {
        let node = self.graph.live_mut(variable)?;
        let actual = node.kind.kind_name();
        node.kind
            .as_variable_mut()
            .map(|v| v.data_mut())
            .ok_or_else(|| not_a_variable(variable, actual))
    }

    /// Arena cursors after the last step
    pub fn arena_usage(&self) -> ArenaUsage {
        self.arena.usage()
    }

    fn step(&mut self, index: usize, kind: StepKind) -> Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(GraphError::SessionPoisoned { reason: reason.clone() }.into());
        }
        let batch = self.mini_batch(index)?;

        let result = self.run(batch, kind);
        match &result {
            Ok(()) => self.steps += 1,
            Err(err) => {
                let reason = format!("{:#}", err);
                error!(%reason, batch = index, ?kind, "step failed, poisoning session");
                self.poisoned = Some(reason);
            }
        }
        result
    }

    fn run(&mut self, batch: MiniBatch, kind: StepKind) -> Result<()> {
        trace!(batch = batch.index, size = batch.size, ?kind, "step");
        for &id in &self.order {
            self.graph.live_mut(id)?.kind.operation_mut().on_mini_batch(batch);
        }

        self.arena.reset();
        self.outputs.fill(TensorPointer::NULL);
        self.pending.fill(TensorPointer::NULL);

        self.forward(batch, kind)?;
        if kind != StepKind::Evaluate {
            self.backward(batch, kind)?;
        }
        Ok(())
    }

    fn forward(&mut self, batch: MiniBatch, kind: StepKind) -> Result<()> {
        let terminal = self.graph.terminal();
        let terminal_mode = match kind {
            StepKind::Evaluate => CostMode::FullPass,
            _ => self.graph.cost_mode(),
        };

        for &id in &self.order {
            let node = self.graph.live_mut(id)?;
            let left = node.left.map_or(TensorPointer::NULL, |l| self.outputs[l.0]);
            let right = node.right.map_or(TensorPointer::NULL, |r| self.outputs[r.0]);
            let mode = if id == terminal { terminal_mode } else { CostMode::FullPass };

            let mut ctx = OpContext::forward(&mut self.arena, left, right, batch, mode);
            let out = node
                .kind
                .operation_mut()
                .forward(&mut ctx)
                .with_context(|| format!("forward of {} ({})", id, node.name))?;
            self.outputs[id.0] = out;
        }
        Ok(())
    }

    fn backward(&mut self, batch: MiniBatch, kind: StepKind) -> Result<()> {
        let terminal = self.graph.terminal();
        let root = self.graph.live(terminal)?;
        if !root.requires_backward() {
            return Ok(());
        }
        if !root.kind().operation().is_cost() {
            let seed = self.arena.allocate_backward(stride(root.shape()))?;
            self.arena.slice_mut(seed)?.fill(1.0);
            self.pending[terminal.0] = seed;
        }

        let learning_rate = self.config.learning_rate;
        let record = kind == StepKind::Gradients || self.config.record_leaf_gradients;

        for depth in 0..self.by_depth.len() {
            for &id in &self.by_depth[depth] {
                let node = self.graph.live_mut(id)?;
                if !node.requires_backward {
                    continue;
                }
                let upstream = std::mem::replace(&mut self.pending[id.0], TensorPointer::NULL);
                if upstream.is_null() && id != terminal {
                    return Err(GraphError::InvalidGraph(format!(
                        "no gradient reached {} ({})",
                        id,
                        node.name
                    ))
                    .into());
                }

                if let ExecKind::Variable(variable) = &mut node.kind {
                    if record {
                        let recorded = self.recorded[id.0].get_or_insert_with(Vec::new);
                        recorded.clear();
                        recorded.extend_from_slice(self.arena.slice(upstream)?);
                    }
                    if kind == StepKind::Train {
                        variable
                            .apply_gradient(&mut self.arena, upstream, learning_rate)
                            .with_context(|| format!("updating {} ({})", id, node.name))?;
                    }
                    continue;
                }

                let left = node.left.map_or(TensorPointer::NULL, |l| self.outputs[l.0]);
                let right = node.right.map_or(TensorPointer::NULL, |r| self.outputs[r.0]);
                let output = self.outputs[id.0];
                let operands = [(node.sides.left, node.left), (node.sides.right, node.right)];

                for (is_left, (wanted, operand)) in [true, false].into_iter().zip(operands) {
                    let Some(target) = operand.filter(|_| wanted) else {
                        continue;
                    };
                    let mut ctx = OpContext::backward(
                        &mut self.arena,
                        left,
                        right,
                        output,
                        upstream,
                        batch,
                    );
                    let op = node.kind.operation_mut();
                    let contribution = if is_left {
                        op.left_backward(&mut ctx)
                    } else {
                        op.right_backward(&mut ctx)
                    }
                    .with_context(|| {
                        let side = if is_left { "left" } else { "right" };
                        format!("{} backward of {} ({})", side, id, node.name)
                    })?;
                    accumulate(&mut self.arena, &mut self.pending, id, target, contribution)?;
                }
            }

            carry_pending(&mut self.arena, &mut self.pending)?;
            self.arena.swap_backward();
        }
        Ok(())
    }
}

fn not_a_variable(node: NodeId, actual: &'static str) -> anyhow::Error {
    GraphError::WrongKind {
        node,
        expected: "variable",
        actual,
    }
    .into()
}

/// Make `contribution` the pending gradient of `target`, summing in any
/// gradient already pending
fn accumulate(
    arena: &mut MemoryArena,
    pending: &mut [TensorPointer],
    node: NodeId,
    target: NodeId,
    contribution: TensorPointer,
) -> Result<()> {
    if arena.role_of(contribution) != Some(BackwardRole::Current) {
        return Err(GraphError::MisplacedGradient { node }.into());
    }
    let previous = pending[target.0];
    if !previous.is_null() {
        let (view, dst) = arena.split_for_write(contribution)?;
        add_assign(dst, view.slice(previous)?)?;
    }
    pending[target.0] = contribution;
    Ok(())
}

/// Copy pending gradients out of the previous slot before it is reused
fn carry_pending(arena: &mut MemoryArena, pending: &mut [TensorPointer]) -> Result<()> {
    for slot in pending.iter_mut() {
        if arena.role_of(*slot) != Some(BackwardRole::Previous) {
            continue;
        }
        let moved = arena
            .allocate_backward(slot.len())
            .context("carrying a pending gradient across a layer")?;
        let (view, dst) = arena.split_for_write(moved)?;
        dst.copy_from_slice(view.slice(*slot)?);
        *slot = moved;
    }
    Ok(())
}
