//! Target program builder interface
//!
//! The compiler never sees the target program's wire format. It drives a
//! [`ProgramBuilder`] and gets back opaque tensor ids:
//!
//! ```text
//!   Compiler                         ProgramBuilder
//!   ────────                         ──────────────
//!   init_inputs   ──────────────►    add_input_tensor
//!   lower_weights ──────────────►    add_initialized_input_tensor
//!   lower_body    ──(handlers)──►    add_op
//!   init_outputs  ──────────────►    add_output_tensor
//!   export        ──────────────►    serialize
//! ```

use crate::attrs::AttributeMap;
use crate::dtype::DataType;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque target tensor identifier
pub type TensorId = String;

/// Element type and shape of a target tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: DataType,
    pub shape: Vec<i64>,
}

impl TensorInfo {
    pub fn new(dtype: DataType, shape: Vec<i64>) -> Self {
        Self { dtype, shape }
    }

    /// Element count; dynamic (negative) dims count as zero
    pub fn numel(&self) -> usize {
        self.shape.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.dtype, self.shape)
    }
}

/// Constant tensor contents embedded in the program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstData {
    pub info: TensorInfo,
    pub data: Vec<u8>,
}

/// Incremental construction of a target program
///
/// Implementations own the program under construction. Ids returned by one
/// call are valid operands for every later call on the same builder.
pub trait ProgramBuilder {
    /// Declare a streamed program input
    fn add_input_tensor(&mut self, info: TensorInfo, debug_name: &str) -> TensorId;

    /// Declare an input initialized with `data`; the returned id is `name`
    fn add_initialized_input_tensor(&mut self, data: ConstData, name: &str) -> Result<TensorId>;

    /// Append an operator of the canonical vocabulary
    fn add_op(
        &mut self,
        op_type: &str,
        inputs: &[TensorId],
        attrs: &AttributeMap,
        num_outputs: usize,
    ) -> Result<Vec<TensorId>>;

    /// Mark an existing tensor as a program output
    fn add_output_tensor(&mut self, id: &TensorId) -> Result<()>;

    fn tensor_info(&self, id: &TensorId) -> Result<TensorInfo>;

    /// Finished program as an opaque blob
    fn serialize(&self) -> Result<Vec<u8>>;
}
