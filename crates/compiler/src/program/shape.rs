//! Output shape propagation for the canonical vocabulary
//!
//! Shapes may carry dynamic dims (`-1`). Propagation is best effort: a
//! dynamic dim stays dynamic, and operators without a rule echo their first
//! input.

use super::builder::TensorInfo;
use crate::attrs::AttributeMap;
use crate::dtype::DataType;
use crate::error::{CompilerError, Result};

/// Infer `num_outputs` output infos for one operator
///
/// `consts[i]` holds the integer contents of input `i` when it is a known
/// constant (Reshape's target shape, OneHot's depth).
pub fn infer_outputs(
    op_type: &str,
    inputs: &[TensorInfo],
    consts: &[Option<Vec<i64>>],
    attrs: &AttributeMap,
    num_outputs: usize,
) -> Result<Vec<TensorInfo>> {
    let first = || -> Result<&TensorInfo> {
        inputs
            .first()
            .ok_or_else(|| CompilerError::invalid(format!("{} requires at least 1 input", op_type)))
    };
    let same_as_first = |n: usize| -> Result<Vec<TensorInfo>> { Ok(vec![first()?.clone(); n]) };

    match op_type {
        "Add" | "Sub" | "Mul" | "Div" => {
            expect_inputs(op_type, inputs, 2)?;
            let shape = broadcast_shapes(&inputs[0].shape, &inputs[1].shape)?;
            Ok(vec![TensorInfo::new(inputs[0].dtype, shape)])
        }

        "Relu" | "Sigmoid" | "Tanh" | "Exp" | "Log" | "Sqrt" | "Softmax" | "Identity" => {
            same_as_first(num_outputs.max(1))
        }

        "Dropout" => {
            let x = first()?;
            let mut outs = vec![x.clone()];
            if num_outputs > 1 {
                outs.push(TensorInfo::new(DataType::Bool, x.shape.clone()));
            }
            Ok(outs)
        }

        "Cast" => {
            let to = DataType::from_name(&attrs.get_str("to")?)?;
            Ok(vec![TensorInfo::new(to, first()?.shape.clone())])
        }

        "MatMul" => {
            expect_inputs(op_type, inputs, 2)?;
            let shape = matmul_shape(&inputs[0].shape, &inputs[1].shape)?;
            Ok(vec![TensorInfo::new(inputs[0].dtype, shape)])
        }

        "Gemm" => {
            if inputs.len() < 2 {
                return Err(CompilerError::invalid(format!(
                    "Gemm requires at least 2 inputs, got {}",
                    inputs.len()
                )));
            }
            let (a, b) = (&inputs[0].shape, &inputs[1].shape);
            if a.len() != 2 || b.len() != 2 {
                return Err(CompilerError::invalid(format!(
                    "Gemm requires 2D operands, got {:?} and {:?}",
                    a, b
                )));
            }
            let m = if attrs.get_int_or("transA", 0)? != 0 { a[1] } else { a[0] };
            let n = if attrs.get_int_or("transB", 0)? != 0 { b[0] } else { b[1] };
            Ok(vec![TensorInfo::new(inputs[0].dtype, vec![m, n])])
        }

        "Transpose" => {
            let x = first()?;
            let shape = match attrs.get("perm") {
                Some(_) => {
                    let perm = attrs.get_ints("perm")?;
                    let mut shape = Vec::with_capacity(perm.len());
                    for &p in &perm {
                        let dim = x.shape.get(p as usize).copied().ok_or_else(|| {
                            CompilerError::invalid(format!(
                                "Transpose perm index {} out of bounds for rank {}",
                                p,
                                x.shape.len()
                            ))
                        })?;
                        shape.push(dim);
                    }
                    shape
                }
                None => x.shape.iter().rev().copied().collect(),
            };
            Ok(vec![TensorInfo::new(x.dtype, shape)])
        }

        "Reshape" => {
            expect_inputs(op_type, inputs, 2)?;
            let target = consts.get(1).cloned().flatten().ok_or_else(|| {
                CompilerError::invalid("Reshape target shape must be a constant")
            })?;
            let shape = reshape_shape(&inputs[0].shape, &target)?;
            Ok(vec![TensorInfo::new(inputs[0].dtype, shape)])
        }

        "Constant" => {
            let dtype = DataType::from_code(attrs.get_int("dtype")?)?;
            let dims = attrs.get_ints("dims")?;
            Ok(vec![TensorInfo::new(dtype, dims)])
        }

        "OneHot" => {
            expect_inputs(op_type, inputs, 3)?;
            let depth = consts
                .get(1)
                .cloned()
                .flatten()
                .and_then(|v| v.first().copied())
                .unwrap_or(-1);
            let mut shape = inputs[0].shape.clone();
            let rank = shape.len() as i64 + 1;
            let axis = attrs.get_int_or("axis", -1)?;
            let axis = if axis < 0 { axis + rank } else { axis };
            if axis < 0 || axis >= rank {
                return Err(CompilerError::invalid(format!(
                    "OneHot axis {} out of range for rank {}",
                    axis, rank
                )));
            }
            shape.insert(axis as usize, depth);
            Ok(vec![TensorInfo::new(inputs[2].dtype, shape)])
        }

        "ReduceMean" => {
            let x = first()?;
            let rank = x.shape.len() as i64;
            let axes: Vec<i64> = if attrs.contains("axes") {
                attrs
                    .get_ints("axes")?
                    .into_iter()
                    .map(|a| if a < 0 { a + rank } else { a })
                    .collect()
            } else {
                (0..rank).collect()
            };
            let keepdims = attrs.get_int_or("keepdims", 1)? != 0;
            let mut shape = Vec::with_capacity(x.shape.len());
            for (i, &d) in x.shape.iter().enumerate() {
                if axes.contains(&(i as i64)) {
                    if keepdims {
                        shape.push(1);
                    }
                } else {
                    shape.push(d);
                }
            }
            Ok(vec![TensorInfo::new(x.dtype, shape)])
        }

        "Flatten" => {
            let x = first()?;
            let rank = x.shape.len() as i64;
            let axis = attrs.get_int_or("axis", 1)?;
            let axis = if axis < 0 { axis + rank } else { axis };
            let axis = axis.clamp(0, rank) as usize;
            let outer = fold_dims(&x.shape[..axis]);
            let inner = fold_dims(&x.shape[axis..]);
            Ok(vec![TensorInfo::new(x.dtype, vec![outer, inner])])
        }

        "BatchNormalization" => {
            let x = first()?;
            let channels = x.shape.get(1).copied().unwrap_or(-1);
            let mut outs = vec![x.clone()];
            for _ in 1..num_outputs {
                outs.push(TensorInfo::new(x.dtype, vec![channels]));
            }
            Ok(outs)
        }

        "NllLoss" => {
            expect_inputs(op_type, inputs, 2)?;
            let shape = match attrs.get_str_or("reduction", "mean".to_string())?.as_str() {
                "none" => inputs[1].shape.clone(),
                _ => Vec::new(),
            };
            Ok(vec![TensorInfo::new(inputs[0].dtype, shape)])
        }

        _ => same_as_first(num_outputs),
    }
}

fn expect_inputs(op_type: &str, inputs: &[TensorInfo], n: usize) -> Result<()> {
    if inputs.len() != n {
        return Err(CompilerError::invalid(format!(
            "{} requires {} inputs, got {}",
            op_type,
            n,
            inputs.len()
        )));
    }
    Ok(())
}

/// Product of dims, or -1 when any is dynamic
fn fold_dims(dims: &[i64]) -> i64 {
    if dims.iter().any(|&d| d < 0) {
        -1
    } else {
        dims.iter().product()
    }
}

/// Broadcast two shapes according to NumPy broadcasting rules
pub fn broadcast_shapes(shape1: &[i64], shape2: &[i64]) -> Result<Vec<i64>> {
    let max_len = shape1.len().max(shape2.len());
    let mut output_shape = Vec::with_capacity(max_len);

    for i in 0..max_len {
        let dim1 = if i < shape1.len() { shape1[shape1.len() - 1 - i] } else { 1 };
        let dim2 = if i < shape2.len() { shape2[shape2.len() - 1 - i] } else { 1 };

        let dim = match (dim1, dim2) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) if a < 0 || b < 0 => a.max(b),
            (a, b) => {
                return Err(CompilerError::invalid(format!(
                    "Incompatible broadcast dimensions: {} and {}",
                    a, b
                )))
            }
        };
        output_shape.push(dim);
    }

    output_shape.reverse();
    Ok(output_shape)
}

/// MatMul output shape with NumPy semantics for rank-1 operands
pub fn matmul_shape(a_shape: &[i64], b_shape: &[i64]) -> Result<Vec<i64>> {
    if a_shape.is_empty() || b_shape.is_empty() {
        return Err(CompilerError::invalid("MatMul operands must have rank >= 1"));
    }
    let a: Vec<i64> = if a_shape.len() == 1 { vec![1, a_shape[0]] } else { a_shape.to_vec() };
    let b: Vec<i64> = if b_shape.len() == 1 { vec![b_shape[0], 1] } else { b_shape.to_vec() };

    let m = a[a.len() - 2];
    let k1 = a[a.len() - 1];
    let k2 = b[b.len() - 2];
    let n = b[b.len() - 1];

    if k1 >= 0 && k2 >= 0 && k1 != k2 {
        return Err(CompilerError::invalid(format!(
            "MatMul dimension mismatch: {} != {}",
            k1, k2
        )));
    }

    let mut shape = broadcast_shapes(&a[..a.len() - 2], &b[..b.len() - 2])?;
    if a_shape.len() > 1 {
        shape.push(m);
    }
    if b_shape.len() > 1 {
        shape.push(n);
    }
    Ok(shape)
}

/// Resolve a Reshape target: `0` copies the input dim, one `-1` is inferred
pub fn reshape_shape(input: &[i64], target: &[i64]) -> Result<Vec<i64>> {
    let mut shape: Vec<i64> = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &d) in target.iter().enumerate() {
        match d {
            0 => shape.push(input.get(i).copied().ok_or_else(|| {
                CompilerError::invalid(format!("Reshape copies dim {} of rank-{} input", i, input.len()))
            })?),
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(CompilerError::invalid("Reshape target has more than one -1"));
                }
                shape.push(-1);
            }
            d if d < 0 => {
                return Err(CompilerError::invalid(format!("invalid Reshape dim {}", d)));
            }
            d => shape.push(d),
        }
    }

    if let Some(at) = infer_at {
        let total = fold_dims(input);
        let known: i64 = shape
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != at)
            .map(|(_, &d)| d)
            .product();
        if total >= 0 && known > 0 {
            if total % known != 0 {
                return Err(CompilerError::invalid(format!(
                    "cannot reshape {:?} into {:?}",
                    input, target
                )));
            }
            shape[at] = total / known;
        }
    }
    Ok(shape)
}
