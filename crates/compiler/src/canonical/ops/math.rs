//! Matrix products, affine scaling and the mean reduction

use super::{emit, x_and_out};
use crate::attrs::AttributeMap;
use crate::canonical::OpBuilder;
use crate::error::{CompilerError, Result};
use crate::graph::NodeId;

/// `matmul`: `transpose_X`, `transpose_Y`, `alpha`
pub fn matmul(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let trans_x = attrs.get_bool_or("transpose_X", false)?;
    let trans_y = attrs.get_bool_or("transpose_Y", false)?;
    let alpha = attrs.get_float_or("alpha", 1.0)?;
    lower_matmul(b, node, trans_x, trans_y, alpha)
}

/// `matmul_v2`: `trans_x`, `trans_y`
pub fn matmul_v2(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let trans_x = attrs.get_bool_or("trans_x", false)?;
    let trans_y = attrs.get_bool_or("trans_y", false)?;
    lower_matmul(b, node, trans_x, trans_y, 1.0)
}

/// 2-D operands fold everything into one `Gemm`; higher ranks get explicit
/// transposes of the two innermost dims, a `MatMul`, and a `Mul` for alpha
fn lower_matmul(b: &mut OpBuilder<'_>, node: NodeId, trans_x: bool, trans_y: bool, alpha: f32) -> Result<()> {
    let x = b.input_node("X", node, 0)?;
    let y = b.input_node("Y", node, 0)?;
    let out = b.output_node("Out", node, 0)?;
    let x_rank = b.input_shape("X", node, 0)?.len();
    let y_rank = b.input_shape("Y", node, 0)?.len();

    if x_rank == 2 && y_rank == 2 {
        b.create_gemm(&[x, y], &[out], trans_x, trans_y, alpha, 1.0)?;
        return Ok(());
    }

    let x = if trans_x { transpose_inner(b, x, x_rank)? } else { x };
    let y = if trans_y { transpose_inner(b, y, y_rank)? } else { y };
    if alpha == 1.0 {
        b.create_base_op("MatMul", &[x, y], &[out], AttributeMap::new())?;
        return Ok(());
    }
    let product = emit(b, "MatMul", &[x, y], AttributeMap::new())?;
    let dtype = b.input_dtype("X", node, 0)?;
    let constant = b.create_scalar_constant(alpha, dtype)?;
    let alpha = b.first_output(constant)?;
    b.create_base_op("Mul", &[product, alpha], &[out], AttributeMap::new())?;
    Ok(())
}

/// Swap the two innermost dims; rank < 2 is returned untouched
fn transpose_inner(b: &mut OpBuilder<'_>, var: NodeId, rank: usize) -> Result<NodeId> {
    if rank < 2 {
        return Ok(var);
    }
    let mut perm: Vec<i64> = (0..rank as i64).collect();
    perm.swap(rank - 2, rank - 1);
    emit(b, "Transpose", &[var], AttributeMap::new().with("perm", perm))
}

/// `mul`: flatten `X` at `x_num_col_dims` and `Y` at `y_num_col_dims`,
/// multiply, then restore `X[..xn] ++ Y[yn..]`
pub fn mul(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let xn = attrs.get_int_or("x_num_col_dims", 1)?;
    let yn = attrs.get_int_or("y_num_col_dims", 1)?;
    let x = b.input_node("X", node, 0)?;
    let y = b.input_node("Y", node, 0)?;
    let out = b.output_node("Out", node, 0)?;
    let x_shape = b.input_shape("X", node, 0)?;
    let y_shape = b.input_shape("Y", node, 0)?;

    if xn < 1 || yn < 1 || xn as usize >= x_shape.len().max(1) || yn as usize >= y_shape.len().max(1) {
        return Err(CompilerError::InvalidAttribute(format!(
            "mul num_col_dims ({}, {}) do not fit shapes {:?} and {:?}",
            xn, yn, x_shape, y_shape
        )));
    }
    if x_shape.len() == 2 && y_shape.len() == 2 {
        b.create_base_op("MatMul", &[x, y], &[out], AttributeMap::new())?;
        return Ok(());
    }

    let x2 = emit(b, "Flatten", &[x], AttributeMap::new().with("axis", xn))?;
    let y2 = emit(b, "Flatten", &[y], AttributeMap::new().with("axis", yn))?;
    let product = emit(b, "MatMul", &[x2, y2], AttributeMap::new())?;
    let mut target = x_shape[..xn as usize].to_vec();
    target.extend_from_slice(&y_shape[yn as usize..]);
    b.create_reshape(&[product], &[out], &target)?;
    Ok(())
}

/// `scale`: `scale * X + bias`, or `scale * (X + bias)` when
/// `bias_after_scale` is false. A `ScaleTensor` operand replaces the
/// `scale` attribute.
pub fn scale(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let factor = attrs.get_float_or("scale", 1.0)?;
    let bias = attrs.get_float_or("bias", 0.0)?;
    let bias_after_scale = attrs.get_bool_or("bias_after_scale", true)?;
    let (x, out) = x_and_out(b, node)?;
    let dtype = b.input_dtype("X", node, 0)?;

    let multiplier = if b.has_input("ScaleTensor", node) {
        Some(b.input_node("ScaleTensor", node, 0)?)
    } else if factor != 1.0 {
        let constant = b.create_scalar_constant(factor, dtype)?;
        Some(b.first_output(constant)?)
    } else {
        None
    };
    let addend = if bias != 0.0 {
        let constant = b.create_scalar_constant(bias, dtype)?;
        Some(b.first_output(constant)?)
    } else {
        None
    };

    let steps: Vec<(&str, NodeId)> = match (multiplier, addend, bias_after_scale) {
        (None, None, _) => {
            b.create_base_op("Identity", &[x], &[out], AttributeMap::new())?;
            return Ok(());
        }
        (Some(m), None, _) => vec![("Mul", m)],
        (None, Some(a), _) => vec![("Add", a)],
        (Some(m), Some(a), true) => vec![("Mul", m), ("Add", a)],
        (Some(m), Some(a), false) => vec![("Add", a), ("Mul", m)],
    };

    let mut current = x;
    let last = steps.len() - 1;
    for (i, (kind, operand)) in steps.into_iter().enumerate() {
        if i == last {
            b.create_base_op(kind, &[current, operand], &[out], AttributeMap::new())?;
        } else {
            current = emit(b, kind, &[current, operand], AttributeMap::new())?;
        }
    }
    Ok(())
}

/// `mean`: full reduction to a one-element tensor of shape `[1]`
pub fn mean(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let (x, out) = x_and_out(b, node)?;
    let reduced = emit(b, "ReduceMean", &[x], AttributeMap::new().with("keepdims", 0i64))?;
    b.create_reshape(&[reduced], &[out], &[1])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use crate::attrs::AttrValue;
    use crate::canonical::INPUTS_SLOT;
    use crate::dtype::VarType;
    use crate::graph::Graph;

    fn matmul_graph(kind: &str, x: Vec<i64>, y: Vec<i64>, attrs: &[(&str, AttrValue)]) -> Graph {
        let mut graph = Graph::new();
        graph.add_var("x").shape(x).dtype(VarType::Fp32).finish();
        graph.add_var("y").shape(y).dtype(VarType::Fp32).finish();
        let mut op = graph
            .add_op(kind)
            .input("X", &["x"])
            .input("Y", &["y"])
            .output("Out", &["out"]);
        for (name, value) in attrs {
            op = op.attr(name, value.clone());
        }
        op.finish().unwrap();
        graph
    }

    #[test]
    fn test_matmul_2d_becomes_gemm() {
        let mut graph = matmul_graph(
            "matmul",
            vec![4, 8],
            vec![16, 8],
            &[("transpose_Y", AttrValue::Bool(true)), ("alpha", AttrValue::Float(0.5))],
        );
        canonicalize(&mut graph);
        let gemm = desc(&graph, "Gemm");
        assert_eq!(gemm.attrs.get_int("transB").unwrap(), 1);
        assert_eq!(gemm.attrs.get_int("transA").unwrap(), 0);
        assert_eq!(gemm.attrs.get_float("alpha").unwrap(), 0.5);
        assert_eq!(producer(&graph, "out"), "Gemm");
    }

    #[test]
    fn test_batched_matmul_v2_transposes_inner_dims() {
        let mut graph = matmul_graph(
            "matmul_v2",
            vec![2, 4, 8],
            vec![2, 16, 8],
            &[("trans_y", AttrValue::Bool(true))],
        );
        canonicalize(&mut graph);
        let perm = desc(&graph, "Transpose").attrs.get_ints("perm").unwrap();
        assert_eq!(perm, vec![0, 2, 1]);
        let operands = operands(&graph, "MatMul");
        assert_eq!(operands[0], "x");
        assert_eq!(producer(&graph, &operands[1]), "Transpose");
        assert_eq!(producer(&graph, "out"), "MatMul");
    }

    #[test]
    fn test_batched_matmul_alpha_scales_result() {
        let mut graph = matmul_graph(
            "matmul",
            vec![2, 4, 8],
            vec![2, 8, 3],
            &[("alpha", AttrValue::Float(2.0))],
        );
        canonicalize(&mut graph);
        assert_eq!(producer(&graph, "out"), "Mul");
        let mul_operands = operands(&graph, "Mul");
        assert_eq!(producer(&graph, &mul_operands[0]), "MatMul");
        assert_eq!(producer(&graph, &mul_operands[1]), "Constant");
    }

    #[test]
    fn test_mul_flattens_and_restores_shape() {
        let mut graph = matmul_graph(
            "mul",
            vec![8, 3, 4],
            vec![12, 10],
            &[("x_num_col_dims", AttrValue::Int(1))],
        );
        canonicalize(&mut graph);
        assert_eq!(producer(&graph, "out"), "Reshape");
        let reshape = desc(&graph, "Reshape");
        let constant = graph.predecessors(graph.find_var(&reshape.input(INPUTS_SLOT)[1]).unwrap())[0];
        assert_eq!(
            graph.op(constant).unwrap().attrs.get_ints("value").unwrap(),
            vec![8, 10]
        );
        assert_eq!(
            graph.op_histogram().iter().find(|(k, _)| k == "Flatten").map(|(_, n)| *n),
            Some(2)
        );
    }

    fn scale_graph(attrs: &[(&str, AttrValue)]) -> Graph {
        let mut graph = Graph::new();
        graph.add_var("x").shape(vec![4]).dtype(VarType::Fp32).finish();
        let mut op = graph.add_op("scale").input("X", &["x"]).output("Out", &["out"]);
        for (name, value) in attrs {
            op = op.attr(name, value.clone());
        }
        op.finish().unwrap();
        graph
    }

    #[test]
    fn test_identity_scale() {
        let mut graph = scale_graph(&[]);
        canonicalize(&mut graph);
        assert_eq!(graph.op_histogram(), vec![("Identity".to_string(), 1)]);
    }

    #[test]
    fn test_scale_then_bias_order() {
        let mut graph = scale_graph(&[
            ("scale", AttrValue::Float(2.0)),
            ("bias", AttrValue::Float(1.0)),
        ]);
        canonicalize(&mut graph);
        assert_eq!(producer(&graph, "out"), "Add");
        assert_eq!(producer(&graph, &operands(&graph, "Add")[0]), "Mul");

        let mut graph = scale_graph(&[
            ("scale", AttrValue::Float(2.0)),
            ("bias", AttrValue::Float(1.0)),
            ("bias_after_scale", AttrValue::Bool(false)),
        ]);
        canonicalize(&mut graph);
        assert_eq!(producer(&graph, "out"), "Mul");
        assert_eq!(producer(&graph, &operands(&graph, "Mul")[0]), "Add");
    }

    #[test]
    fn test_mean_reduces_to_one_element() {
        let mut graph = Graph::new();
        graph.add_var("x").shape(vec![4, 3]).finish();
        graph
            .add_op("mean")
            .input("X", &["x"])
            .output("Out", &["loss"])
            .finish()
            .unwrap();
        canonicalize(&mut graph);
        assert_eq!(desc(&graph, "ReduceMean").attrs.get_int("keepdims").unwrap(), 0);
        assert_eq!(producer(&graph, "loss"), "Reshape");
    }
}
