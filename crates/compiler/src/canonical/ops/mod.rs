//! Built-in rewrites, one per framework operator kind
//!
//! Slot names (`X`, `Y`, `Out`, ...) follow the framework's operator
//! definitions.

mod activation;
mod elementwise;
mod math;
mod nn;
mod tensor;

pub use activation::{SoftmaxRewrite, UnaryRewrite};
pub use elementwise::ElementwiseRewrite;

use super::{OpBuilder, RewriteRegistry};
use crate::attrs::AttributeMap;
use crate::error::{CompilerError, Result};
use crate::graph::NodeId;
use std::sync::Arc;

/// Register every built-in rewrite
pub fn register_defaults(registry: &mut RewriteRegistry) {
    registry.register("feed", Arc::new(passthrough));
    registry.register("fetch", Arc::new(passthrough));

    for (kind, canonical) in [
        ("relu", "Relu"),
        ("sigmoid", "Sigmoid"),
        ("tanh", "Tanh"),
        ("exp", "Exp"),
        ("log", "Log"),
        ("sqrt", "Sqrt"),
    ] {
        registry.register(kind, Arc::new(UnaryRewrite(canonical)));
    }
    registry.register("softmax", Arc::new(SoftmaxRewrite));

    for (kind, canonical) in [
        ("elementwise_add", "Add"),
        ("elementwise_sub", "Sub"),
        ("elementwise_mul", "Mul"),
        ("elementwise_div", "Div"),
    ] {
        registry.register(kind, Arc::new(ElementwiseRewrite(canonical)));
    }

    registry.register("matmul", Arc::new(math::matmul));
    registry.register("matmul_v2", Arc::new(math::matmul_v2));
    registry.register("mul", Arc::new(math::mul));
    registry.register("scale", Arc::new(math::scale));
    registry.register("mean", Arc::new(math::mean));

    registry.register("reshape2", Arc::new(tensor::reshape2));
    registry.register("transpose2", Arc::new(tensor::transpose2));
    registry.register("cast", Arc::new(tensor::cast));
    registry.register("fill_constant", Arc::new(tensor::fill_constant));
    registry.register("flatten_contiguous_range", Arc::new(tensor::flatten_contiguous_range));
    registry.register("one_hot", Arc::new(tensor::one_hot));
    registry.register("one_hot_v2", Arc::new(tensor::one_hot_v2));

    registry.register("dropout", Arc::new(nn::dropout));
    registry.register("cross_entropy2", Arc::new(nn::cross_entropy2));
    registry.register("batch_norm", Arc::new(nn::batch_norm));
}

/// `feed` / `fetch`: the driver deletes the node, nothing replaces it
fn passthrough(_builder: &mut OpBuilder<'_>, _node: NodeId) -> Result<()> {
    Ok(())
}

/// `X` operand and `Out` result of a one-in, one-out operator
fn x_and_out(b: &OpBuilder<'_>, node: NodeId) -> Result<(NodeId, NodeId)> {
    Ok((b.input_node("X", node, 0)?, b.output_node("Out", node, 0)?))
}

/// Create `kind` with one fresh result and return that result
fn emit(b: &mut OpBuilder<'_>, kind: &str, inputs: &[NodeId], attrs: AttributeMap) -> Result<NodeId> {
    let op = b.create_base_op(kind, inputs, &[], attrs)?;
    b.first_output(op)
}

/// Fail when any of `slots` binds a variable on `node`
fn reject_inputs(b: &OpBuilder<'_>, node: NodeId, slots: &[&str]) -> Result<()> {
    for slot in slots {
        if b.has_input(slot, node) {
            let kind = &b.op_desc(node)?.op_type;
            return Err(CompilerError::Unimplemented(format!(
                "{} with a runtime {} operand",
                kind, slot
            )));
        }
    }
    Ok(())
}

/// Resolve a possibly negative axis against `rank`
fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    let resolved = if axis < 0 { axis + rank } else { axis };
    if resolved < 0 || resolved >= rank.max(1) {
        return Err(CompilerError::invalid(format!(
            "axis {} out of range for rank {}",
            axis, rank
        )));
    }
    Ok(resolved as usize)
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::canonical::{Canonicalizer, NameGenerator, INPUTS_SLOT};
    use crate::graph::{Graph, NodeId, OpDesc};

    pub fn canonicalize(graph: &mut Graph) {
        Canonicalizer::with_defaults()
            .run(graph, &mut NameGenerator::new())
            .unwrap();
    }

    /// The only operator of kind `kind`
    pub fn single(graph: &Graph, kind: &str) -> NodeId {
        let ops: Vec<_> = graph
            .op_ids()
            .into_iter()
            .filter(|&id| graph.op(id).map(|op| op.op_type == kind).unwrap_or(false))
            .collect();
        assert_eq!(ops.len(), 1, "expected one {} in {:?}", kind, graph.op_histogram());
        ops[0]
    }

    pub fn desc<'g>(graph: &'g Graph, kind: &str) -> &'g OpDesc {
        graph.op(single(graph, kind)).unwrap()
    }

    /// Operand names of the only `kind` operator
    pub fn operands(graph: &Graph, kind: &str) -> Vec<String> {
        desc(graph, kind).input(INPUTS_SLOT).to_vec()
    }

    /// Kind of the operator producing variable `name`
    pub fn producer(graph: &Graph, name: &str) -> String {
        let var = graph.find_var(name).unwrap();
        let op = graph.predecessors(var)[0];
        graph.op(op).unwrap().op_type.clone()
    }
}
