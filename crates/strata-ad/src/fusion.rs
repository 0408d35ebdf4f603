//! Softmax/cross-entropy fusion
//!
//! A softmax whose only consumer is the prediction operand of a
//! cross-entropy is replaced, together with that cross-entropy, by one
//! [`SoftmaxCrossEntropyNode`](crate::ops::SoftmaxCrossEntropyNode). The
//! fused node reads the logits and the target directly and takes the
//! cross-entropy's place: its consumers are re-pointed at it, and it
//! becomes the terminal when the cross-entropy was.
//!
//! Both retired nodes stay in the builder as [`Op::Retired`] so handles to
//! them resolve to a clear error after compilation.
//!
//! The pass is idempotent. Once the pattern applies (softmax with a single
//! cross-entropy consumer) any inconsistency is reported as
//! [`GraphError::InvalidRewrite`] rather than skipped.

use crate::builder::{BuilderNode, GraphBuilder, Op};
use crate::compiler::reachable_from;
use crate::error::GraphError;
use crate::node::NodeId;
use anyhow::Result;
use tracing::debug;

/// Fuse every matching pair reachable from `terminal`
///
/// Returns the number of pairs fused. `terminal` is updated when the
/// terminal cross-entropy is replaced.
pub(crate) fn fuse_softmax_cross_entropy(
    builder: &mut GraphBuilder,
    terminal: &mut NodeId,
) -> Result<usize> {
    let reachable = reachable_from(builder, *terminal)?;
    let candidates: Vec<NodeId> = (0..builder.nodes.len())
        .filter(|&i| reachable[i] && matches!(builder.nodes[i].op, Op::Softmax { .. }))
        .map(NodeId)
        .collect();

    let mut fused = 0;
    for softmax in candidates {
        let Some(consumer) = sole_cross_entropy(builder, softmax)? else {
            continue;
        };
        let into = rewrite(builder, softmax, consumer)?;
        if *terminal == consumer {
            *terminal = into;
        }
        debug!(%softmax, %consumer, %into, "fused softmax into cross-entropy");
        fused += 1;
    }
    Ok(fused)
}

/// The cross-entropy consuming `softmax`, if it is its only consumer
fn sole_cross_entropy(builder: &GraphBuilder, softmax: NodeId) -> Result<Option<NodeId>> {
    let successors = &builder.node(softmax)?.successors;
    let Some(&first) = successors.first() else {
        return Ok(None);
    };
    if successors.iter().any(|&s| s != first) {
        return Ok(None);
    }
    match builder.node(first)?.op {
        Op::CrossEntropy => Ok(Some(first)),
        _ => Ok(None),
    }
}

fn rewrite(builder: &mut GraphBuilder, softmax: NodeId, consumer: NodeId) -> Result<NodeId> {
    let s = builder.node(softmax)?;
    let c = builder.node(consumer)?;

    let Op::Softmax { axis } = s.op else {
        return Err(GraphError::invalid_rewrite(
            softmax,
            consumer,
            "pattern root is not a softmax",
        )
        .into());
    };
    if c.right == Some(softmax) {
        let reason = if c.left == Some(softmax) {
            "softmax feeds both operands of the cross-entropy"
        } else {
            "softmax feeds the target operand of the cross-entropy"
        };
        return Err(GraphError::invalid_rewrite(softmax, consumer, reason).into());
    }
    if c.left != Some(softmax) {
        return Err(GraphError::invalid_rewrite(
            softmax,
            consumer,
            "cross-entropy is listed as a consumer but does not read the softmax",
        )
        .into());
    }
    let Some(logits) = s.left else {
        return Err(GraphError::invalid_rewrite(softmax, consumer, "softmax has no input").into());
    };
    let Some(target) = c.right else {
        return Err(GraphError::invalid_rewrite(
            softmax,
            consumer,
            "cross-entropy has no target",
        )
        .into());
    };
    let target_shape = &builder.node(target)?.shape;
    if *target_shape != s.shape {
        return Err(GraphError::invalid_rewrite(
            softmax,
            consumer,
            format!(
                "target shape {:?} differs from softmax shape {:?}",
                target_shape.as_slice(),
                s.shape.as_slice()
            ),
        )
        .into());
    }

    let into = NodeId(builder.nodes.len());
    let fused = BuilderNode {
        name: format!("softmax_cross_entropy{}", into.0),
        op: Op::SoftmaxCrossEntropy { axis },
        left: Some(logits),
        right: Some(target),
        shape: c.shape.clone(),
        successors: c.successors.clone(),
    };

    replace_successor(builder.node_mut(logits)?, softmax, into);
    replace_successor(builder.node_mut(target)?, consumer, into);
    for downstream in fused.successors.clone() {
        let node = builder.node_mut(downstream)?;
        if node.left == Some(consumer) {
            node.left = Some(into);
        }
        if node.right == Some(consumer) {
            node.right = Some(into);
        }
    }
    builder.nodes.push(fused);

    for retired in [softmax, consumer] {
        let node = builder.node_mut(retired)?;
        node.op = Op::Retired { into };
        node.left = None;
        node.right = None;
        node.successors.clear();
    }
    Ok(into)
}

fn replace_successor(node: &mut BuilderNode, from: NodeId, to: NodeId) {
    if let Some(slot) = node.successors.iter_mut().find(|s| **s == from) {
        *slot = to;
    }
}
