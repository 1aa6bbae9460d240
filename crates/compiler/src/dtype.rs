//! Element types on both sides of the lowering boundary
//!
//! The host framework tags tensors with [`VarType`]; the target program speaks
//! the canonical [`DataType`] vocabulary (ONNX numbering). All translation
//! between the two goes through [`canonical_dtype`] and [`framework_dtype`].

use crate::error::{CompilerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Framework scalar element types, numbered as in the framework's proto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    Bool,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    Uint8,
    Int8,
    Bf16,
    Complex64,
    Complex128,
}

impl VarType {
    /// Every framework scalar type, in proto order
    pub const ALL: [VarType; 12] = [
        VarType::Bool,
        VarType::Int16,
        VarType::Int32,
        VarType::Int64,
        VarType::Fp16,
        VarType::Fp32,
        VarType::Fp64,
        VarType::Uint8,
        VarType::Int8,
        VarType::Bf16,
        VarType::Complex64,
        VarType::Complex128,
    ];

    /// Decode a raw proto tag. Non-scalar tags (LOD_TENSOR, READER, ...) are rejected.
    pub fn from_proto(tag: i32) -> Result<Self> {
        let ty = match tag {
            0 => VarType::Bool,
            1 => VarType::Int16,
            2 => VarType::Int32,
            3 => VarType::Int64,
            4 => VarType::Fp16,
            5 => VarType::Fp32,
            6 => VarType::Fp64,
            20 => VarType::Uint8,
            21 => VarType::Int8,
            22 => VarType::Bf16,
            23 => VarType::Complex64,
            24 => VarType::Complex128,
            other => {
                return Err(CompilerError::Unimplemented(format!(
                    "unsupported data type tag: {}",
                    other
                )))
            }
        };
        Ok(ty)
    }

    /// Decode a tag stored in an INT attribute
    pub fn from_attr(tag: i64) -> Result<Self> {
        let tag = i32::try_from(tag).map_err(|_| {
            CompilerError::InvalidAttribute(format!("data type tag {} out of range", tag))
        })?;
        Self::from_proto(tag)
    }

    /// Raw proto tag
    pub fn proto(&self) -> i32 {
        match self {
            VarType::Bool => 0,
            VarType::Int16 => 1,
            VarType::Int32 => 2,
            VarType::Int64 => 3,
            VarType::Fp16 => 4,
            VarType::Fp32 => 5,
            VarType::Fp64 => 6,
            VarType::Uint8 => 20,
            VarType::Int8 => 21,
            VarType::Bf16 => 22,
            VarType::Complex64 => 23,
            VarType::Complex128 => 24,
        }
    }

    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            VarType::Bool | VarType::Uint8 | VarType::Int8 => 1,
            VarType::Int16 | VarType::Fp16 | VarType::Bf16 => 2,
            VarType::Int32 | VarType::Fp32 => 4,
            VarType::Int64 | VarType::Fp64 | VarType::Complex64 => 8,
            VarType::Complex128 => 16,
        }
    }

    /// Name used by the target's `Cast` operator for its `to` attribute
    pub fn cast_name(&self) -> Result<&'static str> {
        let name = match self {
            VarType::Uint8 => "UINT8",
            VarType::Int8 => "INT8",
            VarType::Int16 => "INT16",
            VarType::Int32 => "INT32",
            VarType::Int64 => "INT64",
            VarType::Bool => "BOOL",
            VarType::Fp64 => "DOUBLE",
            VarType::Fp32 => "FLOAT",
            VarType::Fp16 => "FLOAT16",
            VarType::Bf16 | VarType::Complex64 | VarType::Complex128 => {
                return Err(CompilerError::Unavailable(format!(
                    "no cast target name for data type {}",
                    self
                )))
            }
        };
        Ok(name)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VarType::Bool => "bool",
            VarType::Int16 => "int16",
            VarType::Int32 => "int32",
            VarType::Int64 => "int64",
            VarType::Fp16 => "float16",
            VarType::Fp32 => "float32",
            VarType::Fp64 => "float64",
            VarType::Uint8 => "uint8",
            VarType::Int8 => "int8",
            VarType::Bf16 => "bfloat16",
            VarType::Complex64 => "complex64",
            VarType::Complex128 => "complex128",
        };
        write!(f, "{}", s)
    }
}

/// Canonical element types understood by the target program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Double,
    Uint32,
    Uint64,
    Complex64,
    Complex128,
    BFloat16,
}

impl DataType {
    /// ONNX `TensorProto.DataType` code
    pub fn code(&self) -> i64 {
        match self {
            DataType::Float => 1,
            DataType::Uint8 => 2,
            DataType::Int8 => 3,
            DataType::Uint16 => 4,
            DataType::Int16 => 5,
            DataType::Int32 => 6,
            DataType::Int64 => 7,
            DataType::String => 8,
            DataType::Bool => 9,
            DataType::Float16 => 10,
            DataType::Double => 11,
            DataType::Uint32 => 12,
            DataType::Uint64 => 13,
            DataType::Complex64 => 14,
            DataType::Complex128 => 15,
            DataType::BFloat16 => 16,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        let ty = match code {
            1 => DataType::Float,
            2 => DataType::Uint8,
            3 => DataType::Int8,
            4 => DataType::Uint16,
            5 => DataType::Int16,
            6 => DataType::Int32,
            7 => DataType::Int64,
            8 => DataType::String,
            9 => DataType::Bool,
            10 => DataType::Float16,
            11 => DataType::Double,
            12 => DataType::Uint32,
            13 => DataType::Uint64,
            14 => DataType::Complex64,
            15 => DataType::Complex128,
            16 => DataType::BFloat16,
            other => {
                return Err(CompilerError::Unimplemented(format!(
                    "unsupported canonical data type code: {}",
                    other
                )))
            }
        };
        Ok(ty)
    }

    /// Upper-case name, matching the `Cast` operator's `to` spelling
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float => "FLOAT",
            DataType::Uint8 => "UINT8",
            DataType::Int8 => "INT8",
            DataType::Uint16 => "UINT16",
            DataType::Int16 => "INT16",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::String => "STRING",
            DataType::Bool => "BOOL",
            DataType::Float16 => "FLOAT16",
            DataType::Double => "DOUBLE",
            DataType::Uint32 => "UINT32",
            DataType::Uint64 => "UINT64",
            DataType::Complex64 => "COMPLEX64",
            DataType::Complex128 => "COMPLEX128",
            DataType::BFloat16 => "BFLOAT16",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let ty = match name {
            "FLOAT" => DataType::Float,
            "UINT8" => DataType::Uint8,
            "INT8" => DataType::Int8,
            "UINT16" => DataType::Uint16,
            "INT16" => DataType::Int16,
            "INT32" => DataType::Int32,
            "INT64" => DataType::Int64,
            "STRING" => DataType::String,
            "BOOL" => DataType::Bool,
            "FLOAT16" => DataType::Float16,
            "DOUBLE" => DataType::Double,
            "UINT32" => DataType::Uint32,
            "UINT64" => DataType::Uint64,
            "COMPLEX64" => DataType::Complex64,
            "COMPLEX128" => DataType::Complex128,
            "BFLOAT16" => DataType::BFloat16,
            other => {
                return Err(CompilerError::Unimplemented(format!(
                    "unsupported canonical data type name: {}",
                    other
                )))
            }
        };
        Ok(ty)
    }

    /// Size of one element in bytes (strings report 0)
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::String => 0,
            DataType::Bool | DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 | DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Float | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Double | DataType::Int64 | DataType::Uint64 | DataType::Complex64 => 8,
            DataType::Complex128 => 16,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Framework element type → canonical element type
pub fn canonical_dtype(ty: VarType) -> DataType {
    match ty {
        VarType::Bool => DataType::Bool,
        VarType::Int16 => DataType::Int16,
        VarType::Int32 => DataType::Int32,
        VarType::Int64 => DataType::Int64,
        VarType::Fp16 => DataType::Float16,
        VarType::Fp32 => DataType::Float,
        VarType::Fp64 => DataType::Double,
        VarType::Uint8 => DataType::Uint8,
        VarType::Int8 => DataType::Int8,
        VarType::Bf16 => DataType::BFloat16,
        VarType::Complex64 => DataType::Complex64,
        VarType::Complex128 => DataType::Complex128,
    }
}

/// Canonical element type → framework element type
///
/// Canonical types with no framework counterpart (unsigned wide ints, strings)
/// fail with [`CompilerError::Unimplemented`].
pub fn framework_dtype(ty: DataType) -> Result<VarType> {
    let var = match ty {
        DataType::Bool => VarType::Bool,
        DataType::Int16 => VarType::Int16,
        DataType::Int32 => VarType::Int32,
        DataType::Int64 => VarType::Int64,
        DataType::Float16 => VarType::Fp16,
        DataType::Float => VarType::Fp32,
        DataType::Double => VarType::Fp64,
        DataType::Uint8 => VarType::Uint8,
        DataType::Int8 => VarType::Int8,
        DataType::BFloat16 => VarType::Bf16,
        DataType::Complex64 => VarType::Complex64,
        DataType::Complex128 => VarType::Complex128,
        DataType::Uint16 | DataType::Uint32 | DataType::Uint64 | DataType::String => {
            return Err(CompilerError::Unimplemented(format!(
                "data type {} has no framework counterpart",
                ty
            )))
        }
    };
    Ok(var)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_types_round_trip() {
        for ty in VarType::ALL {
            let canonical = canonical_dtype(ty);
            assert_eq!(framework_dtype(canonical).unwrap(), ty);
            assert_eq!(VarType::from_proto(ty.proto()).unwrap(), ty);
            assert_eq!(canonical.size_in_bytes(), ty.size_in_bytes());
        }
    }

    #[test]
    fn test_unknown_proto_tag_is_unimplemented() {
        // 7 is LOD_TENSOR, not a scalar type
        let err = VarType::from_proto(7).unwrap_err();
        assert!(matches!(err, CompilerError::Unimplemented(_)));
    }

    #[test]
    fn test_attr_tag_out_of_i32_range_is_invalid() {
        // would truncate to 5 (FP32)
        let err = VarType::from_attr((1i64 << 32) + 5).unwrap_err();
        assert!(matches!(err, CompilerError::InvalidAttribute(_)));
        assert_eq!(VarType::from_attr(3).unwrap(), VarType::Int64);
    }

    #[test]
    fn test_cast_names() {
        assert_eq!(VarType::Fp32.cast_name().unwrap(), "FLOAT");
        assert_eq!(VarType::Int64.cast_name().unwrap(), "INT64");
        assert!(matches!(
            VarType::Bf16.cast_name(),
            Err(CompilerError::Unavailable(_))
        ));
    }

    #[test]
    fn test_canonical_codes_and_names() {
        assert_eq!(DataType::from_code(7).unwrap(), DataType::Int64);
        assert_eq!(DataType::from_name("FLOAT16").unwrap(), DataType::Float16);
        assert!(framework_dtype(DataType::Uint32).is_err());
    }
}
