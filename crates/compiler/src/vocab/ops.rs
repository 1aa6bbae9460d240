//! The canonical operator table

use super::{AttrDefault, LoweringOp, SymbolHandler};
use crate::attrs::AttributeMap;
use crate::error::{CompilerError, Result};
use crate::program::{ProgramBuilder, TensorId};
use tracing::debug;

define_canonical_ops! {
    // Activations
    Relu => "Relu", inputs: 1..=1, outputs: 1, attrs: [],
    Sigmoid => "Sigmoid", inputs: 1..=1, outputs: 1, attrs: [],
    Tanh => "Tanh", inputs: 1..=1, outputs: 1, attrs: [],
    Exp => "Exp", inputs: 1..=1, outputs: 1, attrs: [],
    Log => "Log", inputs: 1..=1, outputs: 1, attrs: [],
    Sqrt => "Sqrt", inputs: 1..=1, outputs: 1, attrs: [],
    Softmax => "Softmax", inputs: 1..=1, outputs: 1, attrs: [("axis": Int = -1i64)],

    // Element-wise arithmetic (NumPy broadcasting)
    Add => "Add", inputs: 2..=2, outputs: 1, attrs: [],
    Sub => "Sub", inputs: 2..=2, outputs: 1, attrs: [],
    Mul => "Mul", inputs: 2..=2, outputs: 1, attrs: [],
    Div => "Div", inputs: 2..=2, outputs: 1, attrs: [],

    // Matrix
    MatMul => "MatMul", inputs: 2..=2, outputs: 1, attrs: [],
    /// `alpha * op(A) * op(B) + beta * C`
    Gemm => "Gemm", inputs: 2..=3, outputs: 1, attrs: [
        ("alpha": Float = 1.0f32),
        ("beta": Float = 1.0f32),
        ("transA": Int = 0i64),
        ("transB": Int = 0i64),
    ],

    // Tensor manipulation
    Transpose => "Transpose", inputs: 1..=1, outputs: 1, attrs: [("perm": opt Ints)],
    /// Second operand is an INT64 constant holding the target shape
    Reshape => "Reshape", inputs: 2..=2, outputs: 1, attrs: [],
    Flatten => "Flatten", inputs: 1..=1, outputs: 1, attrs: [("axis": Int = 1i64)],
    Cast => "Cast", inputs: 1..=1, outputs: 1, attrs: [("to": Str)],
    Identity => "Identity", inputs: 1..=1, outputs: 1, attrs: [],
    Constant => "Constant", inputs: 0..=0, outputs: 1, attrs: [
        ("value": opt Floats),
        ("dims": Ints),
        ("dtype": Int),
    ],
    /// Operands: indices, depth, `[off, on]` values
    OneHot => "OneHot", inputs: 3..=3, outputs: 1, attrs: [("axis": Int = -1i64)],

    // Training
    Dropout => "Dropout", inputs: 1..=1, outputs: 1, attrs: [("ratio": Float = 0.5f32)],
    ReduceMean => "ReduceMean", inputs: 1..=1, outputs: 1, attrs: [
        ("axes": opt Ints),
        ("keepdims": Int = 1i64),
    ],
    BatchNormalization => "BatchNormalization", inputs: 5..=5, outputs: 1, attrs: [
        ("epsilon": Float = 1e-5f32),
        ("momentum": Float = 0.9f32),
    ],
    NllLoss => "NllLoss", inputs: 2..=2, outputs: 1, attrs: [
        ("reduction": Str = "mean"),
        ("ignoreIndex": opt Int),
    ],
}

impl CanonicalOp {
    /// Check the operand count against the table
    pub fn check_arity(&self, got: usize) -> Result<()> {
        let (min, max) = self.arity();
        if got < min || got > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{}..={}", min, max)
            };
            return Err(CompilerError::invalid(format!(
                "{} takes {} operands, got {}",
                self, expected, got
            )));
        }
        Ok(())
    }

    /// Project `attrs` onto the schema: defaults applied, nullable absences
    /// dropped, unknown keys ignored
    pub fn normalize_attrs(&self, attrs: &AttributeMap) -> Result<AttributeMap> {
        let mut out = AttributeMap::new();
        for spec in self.attr_specs() {
            if let Some(value) = spec.resolve(attrs)? {
                out.set(spec.name, value);
            }
        }
        for (name, _) in attrs.iter() {
            if !self.attr_specs().iter().any(|s| s.name == name) && !name.starts_with("__") {
                debug!(op = %self, attr = name, "dropping attribute outside the schema");
            }
        }
        Ok(out)
    }

    /// Names of required attributes
    pub fn required_attrs(&self) -> Vec<&'static str> {
        self.attr_specs()
            .into_iter()
            .filter(|s| s.default == AttrDefault::Required)
            .map(|s| s.name)
            .collect()
    }
}

/// Table-driven lowering: arity check, attribute normalization, one `add_op`
#[derive(Debug, Clone, Copy)]
pub struct GenericLowering(pub CanonicalOp);

impl SymbolHandler for GenericLowering {
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>> {
        let canonical = self.0;
        canonical.check_arity(op.inputs.len())?;
        let attrs = canonical.normalize_attrs(op.attrs)?;
        let num_outputs = if op.num_outputs == 0 {
            canonical.default_outputs()
        } else {
            op.num_outputs
        };
        builder.add_op(canonical.name(), &op.inputs, &attrs, num_outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttrValue;
    use crate::dtype::DataType;
    use crate::program::{ProgramRecorder, TensorInfo};

    #[test]
    fn test_table_names_round_trip() {
        for op in CanonicalOp::ALL {
            assert_eq!(CanonicalOp::from_name(op.name()), Some(*op));
        }
        assert_eq!(CanonicalOp::from_name("relu"), None);
    }

    #[test]
    fn test_gemm_defaults_are_filled() {
        let attrs = AttributeMap::new().with("transB", 1i64).with("extra", 3i64);
        let out = CanonicalOp::Gemm.normalize_attrs(&attrs).unwrap();
        let names: Vec<_> = out.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["alpha", "beta", "transA", "transB"]);
        assert_eq!(out.get("transB"), Some(&AttrValue::Int(1)));
        assert_eq!(out.get("alpha"), Some(&AttrValue::Float(1.0)));
    }

    #[test]
    fn test_required_attribute_missing() {
        assert_eq!(CanonicalOp::Cast.required_attrs(), vec!["to"]);
        let err = CanonicalOp::Cast
            .normalize_attrs(&AttributeMap::new())
            .unwrap_err();
        assert!(matches!(err, CompilerError::MissingAttribute(name) if name == "to"));
    }

    #[test]
    fn test_nullable_attribute_is_omitted() {
        let out = CanonicalOp::Transpose
            .normalize_attrs(&AttributeMap::new())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_generic_lowering_checks_arity() {
        let mut rec = ProgramRecorder::new();
        let x = rec.add_input_tensor(TensorInfo::new(DataType::Float, vec![2]), "x");
        let attrs = AttributeMap::new();
        let op = LoweringOp {
            op_type: "Add",
            inputs: vec![x.clone()],
            attrs: &attrs,
            num_outputs: 1,
        };
        assert!(GenericLowering(CanonicalOp::Add).lower(&mut rec, &op).is_err());

        let op = LoweringOp {
            op_type: "Relu",
            inputs: vec![x],
            attrs: &attrs,
            num_outputs: 1,
        };
        let out = GenericLowering(CanonicalOp::Relu).lower(&mut rec, &op).unwrap();
        assert_eq!(out.len(), 1);
    }
}
