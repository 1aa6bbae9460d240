//! Hand-written lowering handlers

use super::{CanonicalOp, LoweringOp, SymbolHandler};
use crate::attrs::{AttrValue, AttributeMap};
use crate::dtype::DataType;
use crate::error::{CompilerError, Result};
use crate::program::{ProgramBuilder, TensorId};

/// `Constant`: validates that `value` fills `dims` and stores it in the
/// representation its `dtype` calls for (ints for integer types, floats
/// otherwise)
#[derive(Debug, Clone, Copy)]
pub struct ConstantLowering;

impl SymbolHandler for ConstantLowering {
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>> {
        CanonicalOp::Constant.check_arity(op.inputs.len())?;
        let dims = op.attrs.get_ints("dims")?;
        let dtype = DataType::from_code(op.attrs.get_int("dtype")?)?;
        let expected: i64 = dims.iter().product();

        let value = match op.attrs.get("value") {
            Some(AttrValue::Ints(v)) => v.iter().map(|&x| x as f64).collect::<Vec<_>>(),
            Some(AttrValue::Floats(v)) => v.iter().map(|&x| x as f64).collect(),
            Some(AttrValue::Int(v)) => vec![*v as f64],
            Some(AttrValue::Float(v)) => vec![*v as f64],
            Some(other) => {
                return Err(CompilerError::InvalidAttribute(format!(
                    "Constant value must be numeric, got {}",
                    other
                )))
            }
            None => return Err(CompilerError::MissingAttribute("value".to_string())),
        };
        if value.len() as i64 != expected {
            return Err(CompilerError::InvalidAttribute(format!(
                "Constant value has {} elements, dims {:?} need {}",
                value.len(),
                dims,
                expected
            )));
        }

        let value = match dtype {
            DataType::Float | DataType::Float16 | DataType::Double | DataType::BFloat16 => {
                AttrValue::Floats(value.into_iter().map(|x| x as f32).collect())
            }
            DataType::String | DataType::Complex64 | DataType::Complex128 => {
                return Err(CompilerError::Unavailable(format!(
                    "Constant of type {} is not supported",
                    dtype
                )))
            }
            _ => AttrValue::Ints(value.into_iter().map(|x| x as i64).collect()),
        };

        let attrs = AttributeMap::new()
            .with("value", value)
            .with("dims", dims)
            .with("dtype", dtype.code());
        builder.add_op(CanonicalOp::Constant.name(), &[], &attrs, 1)
    }
}

/// `ReduceMean`: an empty or absent `axes` reduces over every dim
#[derive(Debug, Clone, Copy)]
pub struct ReduceMeanLowering;

impl SymbolHandler for ReduceMeanLowering {
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>> {
        CanonicalOp::ReduceMean.check_arity(op.inputs.len())?;
        let mut attrs = AttributeMap::new();
        let axes = op.attrs.get_ints_or("axes", Vec::new())?;
        if !axes.is_empty() {
            attrs.set("axes", axes);
        }
        attrs.set("keepdims", op.attrs.get_int_or("keepdims", 1)?);
        builder.add_op(CanonicalOp::ReduceMean.name(), &op.inputs, &attrs, 1)
    }
}

/// `BatchNormalization`: one output in inference, five when training
/// statistics are requested (`y, mean, var, saved_mean, saved_var`)
#[derive(Debug, Clone, Copy)]
pub struct BatchNormLowering;

impl SymbolHandler for BatchNormLowering {
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>> {
        CanonicalOp::BatchNormalization.check_arity(op.inputs.len())?;
        let num_outputs = op.num_outputs.max(1);
        if num_outputs != 1 && num_outputs != 5 {
            return Err(CompilerError::invalid(format!(
                "BatchNormalization produces 1 or 5 outputs, {} requested",
                num_outputs
            )));
        }
        let attrs = CanonicalOp::BatchNormalization.normalize_attrs(op.attrs)?;
        builder.add_op(
            CanonicalOp::BatchNormalization.name(),
            &op.inputs,
            &attrs,
            num_outputs,
        )
    }
}

/// `NllLoss`: `reduction` is one of `none`, `mean`, `sum`
#[derive(Debug, Clone, Copy)]
pub struct NllLossLowering;

impl SymbolHandler for NllLossLowering {
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>> {
        CanonicalOp::NllLoss.check_arity(op.inputs.len())?;
        let attrs = CanonicalOp::NllLoss.normalize_attrs(op.attrs)?;
        let reduction = attrs.get_str("reduction")?;
        if !matches!(reduction.as_str(), "none" | "mean" | "sum") {
            return Err(CompilerError::InvalidAttribute(format!(
                "NllLoss reduction {:?}",
                reduction
            )));
        }
        builder.add_op(CanonicalOp::NllLoss.name(), &op.inputs, &attrs, 1)
    }
}
