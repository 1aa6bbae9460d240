//! Shape and type manipulation: reshape, transpose, cast, constants, one-hot

use super::{normalize_axis, reject_inputs, x_and_out};
use crate::attrs::AttributeMap;
use crate::canonical::OpBuilder;
use crate::dtype::{canonical_dtype, VarType};
use crate::error::{CompilerError, Result};
use crate::graph::NodeId;
use crate::tensor::numel;

/// `reshape2` with a static `shape` attribute
pub fn reshape2(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    reject_inputs(b, node, &["Shape", "ShapeTensor"])?;
    let shape = b.attrs(node)?.get_ints("shape")?;
    let (x, out) = x_and_out(b, node)?;
    b.create_reshape(&[x], &[out], &shape)?;
    Ok(())
}

/// `transpose2` with its `axis` permutation
pub fn transpose2(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let perm = b.attrs(node)?.get_ints("axis")?;
    let (x, out) = x_and_out(b, node)?;
    b.create_base_op("Transpose", &[x], &[out], AttributeMap::new().with("perm", perm))?;
    Ok(())
}

/// `cast` to the framework type tag in `out_dtype`
pub fn cast(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let tag = b.attrs(node)?.get_int("out_dtype")?;
    let to = VarType::from_attr(tag)?;
    let (x, out) = x_and_out(b, node)?;
    b.create_cast(&[x], &[out], to)?;
    Ok(())
}

/// `fill_constant` with a static shape: one `Constant` holding `value`
/// (or the parsed `str_value`) repeated over the shape
pub fn fill_constant(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    reject_inputs(b, node, &["ShapeTensor", "ShapeTensorList", "ValueTensor"])?;
    let attrs = b.attrs(node)?;
    let shape = attrs.get_ints("shape")?;
    let dtype = VarType::from_attr(attrs.get_int_or("dtype", VarType::Fp32.proto() as i64)?)?;
    let str_value = attrs.get_str_or("str_value", String::new())?;
    let value = if str_value.is_empty() {
        attrs.get_float_or("value", 0.0)?
    } else {
        str_value.trim().parse::<f32>().map_err(|_| {
            CompilerError::InvalidAttribute(format!("fill_constant str_value {:?}", str_value))
        })?
    };
    if shape.iter().any(|&d| d < 0) {
        return Err(CompilerError::Unimplemented(format!(
            "fill_constant with dynamic shape {:?}",
            shape
        )));
    }

    let out = b.output_node("Out", node, 0)?;
    let attrs = AttributeMap::new()
        .with("value", vec![value; numel(&shape)])
        .with("dims", shape)
        .with("dtype", canonical_dtype(dtype).code());
    b.create_constant(&[out], attrs)?;
    Ok(())
}

/// `flatten_contiguous_range`: merge dims `start_axis..=stop_axis`
pub fn flatten_contiguous_range(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let start = attrs.get_int_or("start_axis", 1)?;
    let stop = attrs.get_int_or("stop_axis", -1)?;
    let x_shape = b.input_shape("X", node, 0)?;
    let target = flattened_target(&x_shape, start, stop)?;
    let (x, out) = x_and_out(b, node)?;
    b.create_reshape(&[x], &[out], &target)?;
    Ok(())
}

/// Reshape target merging `start..=stop` of `shape`: leading dims are
/// copied (`0`), the merged dim is inferred (`-1`), trailing dims are spelled
/// out
fn flattened_target(shape: &[i64], start: i64, stop: i64) -> Result<Vec<i64>> {
    let start = normalize_axis(start, shape.len())?;
    let stop = normalize_axis(stop, shape.len())?;
    if start > stop {
        return Err(CompilerError::InvalidAttribute(format!(
            "flatten start_axis {} is after stop_axis {}",
            start, stop
        )));
    }
    let trailing = &shape[(stop + 1).min(shape.len())..];
    if trailing.iter().any(|&d| d < 0) {
        return Err(CompilerError::Unimplemented(format!(
            "flatten of {:?} with dynamic dims after stop_axis",
            shape
        )));
    }
    let mut target = vec![0; start];
    target.push(-1);
    target.extend_from_slice(trailing);
    Ok(target)
}

/// `one_hot`: indices carry a trailing unit dim that is squeezed first
pub fn one_hot(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    lower_one_hot(b, node, true)
}

/// `one_hot_v2`: indices are used as they are
pub fn one_hot_v2(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    lower_one_hot(b, node, false)
}

fn lower_one_hot(b: &mut OpBuilder<'_>, node: NodeId, squeeze: bool) -> Result<()> {
    reject_inputs(b, node, &["depth_tensor"])?;
    let attrs = b.attrs(node)?;
    let depth = attrs.get_int("depth")?;
    let dtype = VarType::from_attr(attrs.get_int_or("dtype", VarType::Fp32.proto() as i64)?)?;
    let (mut indices, out) = x_and_out(b, node)?;

    if squeeze {
        let shape = b.input_shape("X", node, 0)?;
        if shape.last() == Some(&1) {
            let reshape = b.create_reshape(&[indices], &[], &shape[..shape.len() - 1])?;
            indices = b.first_output(reshape)?;
        }
    }

    let depth = b.create_int64_constant(&[depth])?;
    let depth = b.first_output(depth)?;
    let values = b.create_constant(
        &[],
        AttributeMap::new()
            .with("value", vec![0.0f32, 1.0])
            .with("dims", vec![2i64])
            .with("dtype", canonical_dtype(dtype).code()),
    )?;
    let values = b.first_output(values)?;
    b.create_base_op(
        "OneHot",
        &[indices, depth, values],
        &[out],
        AttributeMap::new().with("axis", -1i64),
    )?;
    Ok(())
}
