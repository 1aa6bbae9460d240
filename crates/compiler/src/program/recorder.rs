//! Recording program builder
//!
//! [`ProgramRecorder`] keeps every builder call as plain data in a
//! [`TargetProgram`]. Its blob is a small header followed by the program as
//! JSON:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Magic: "GRFT" (4 bytes)      │
//! │ Version: u32 LE (4 bytes)    │
//! ├──────────────────────────────┤
//! │ TargetProgram (JSON)         │
//! └──────────────────────────────┘
//! ```

use super::builder::{ConstData, ProgramBuilder, TensorId, TensorInfo};
use super::shape::infer_outputs;
use crate::attrs::AttributeMap;
use crate::dtype::DataType;
use crate::error::{CompilerError, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Blob magic
pub const PROGRAM_MAGIC: &[u8; 4] = b"GRFT";
/// Blob format version
pub const PROGRAM_VERSION: u32 = 1;

/// One recorded operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramOp {
    pub op_type: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: AttributeMap,
}

/// An initialized input (weight or embedded constant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInitializer {
    pub id: TensorId,
    pub data: ConstData,
}

/// Everything a [`ProgramRecorder`] was told, in call order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetProgram {
    pub inputs: Vec<TensorId>,
    pub initializers: Vec<ProgramInitializer>,
    pub ops: Vec<ProgramOp>,
    pub outputs: Vec<TensorId>,
    /// Info for every tensor, in creation order
    pub tensors: Vec<(TensorId, TensorInfo)>,
}

impl TargetProgram {
    /// Encode as a magic-prefixed blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut bytes = Vec::with_capacity(8 + json.len());
        bytes.extend_from_slice(PROGRAM_MAGIC);
        bytes.extend_from_slice(&PROGRAM_VERSION.to_le_bytes());
        bytes.extend_from_slice(&json);
        Ok(bytes)
    }

    /// Decode a blob produced by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != PROGRAM_MAGIC {
            return Err(CompilerError::invalid("not a program blob (bad magic)"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != PROGRAM_VERSION {
            return Err(CompilerError::Unimplemented(format!(
                "program blob version {} (supported: {})",
                version, PROGRAM_VERSION
            )));
        }
        Ok(serde_json::from_slice(&bytes[8..])?)
    }

    pub fn tensor_info(&self, id: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|(t, _)| t == id).map(|(_, info)| info)
    }

    pub fn initializer(&self, id: &str) -> Option<&ProgramInitializer> {
        self.initializers.iter().find(|init| init.id == id)
    }
}

/// Reference [`ProgramBuilder`] that records calls into a [`TargetProgram`]
#[derive(Debug, Default)]
pub struct ProgramRecorder {
    program: TargetProgram,
    infos: FxHashMap<TensorId, TensorInfo>,
    /// Integer contents of Int64 constants, for shape propagation
    int_consts: FxHashMap<TensorId, Vec<i64>>,
    next_id: usize,
}

impl ProgramRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(&self) -> &TargetProgram {
        &self.program
    }

    pub fn into_program(self) -> TargetProgram {
        self.program
    }

    fn fresh_id(&mut self, prefix: &str) -> TensorId {
        let id = format!("{}:{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn record_tensor(&mut self, id: &TensorId, info: TensorInfo) {
        self.program.tensors.push((id.clone(), info.clone()));
        self.infos.insert(id.clone(), info);
    }
}

fn int_contents(data: &ConstData) -> Option<Vec<i64>> {
    (data.info.dtype == DataType::Int64).then(|| {
        data.data
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned::<i64>)
            .collect()
    })
}

impl ProgramBuilder for ProgramRecorder {
    fn add_input_tensor(&mut self, info: TensorInfo, debug_name: &str) -> TensorId {
        let id = self.fresh_id("input");
        debug!(id = %id, name = debug_name, info = %info, "program input");
        self.record_tensor(&id, info);
        self.program.inputs.push(id.clone());
        id
    }

    fn add_initialized_input_tensor(&mut self, data: ConstData, name: &str) -> Result<TensorId> {
        let id: TensorId = name.to_string();
        if self.infos.contains_key(&id) {
            return Err(CompilerError::invalid(format!(
                "initialized input {} declared twice",
                id
            )));
        }
        if data.data.len() != data.info.size_in_bytes() {
            return Err(CompilerError::invalid(format!(
                "initializer {} has {} bytes, {} needs {}",
                id,
                data.data.len(),
                data.info,
                data.info.size_in_bytes()
            )));
        }
        if let Some(values) = int_contents(&data) {
            self.int_consts.insert(id.clone(), values);
        }
        self.record_tensor(&id, data.info.clone());
        self.program.initializers.push(ProgramInitializer {
            id: id.clone(),
            data,
        });
        Ok(id)
    }

    fn add_op(
        &mut self,
        op_type: &str,
        inputs: &[TensorId],
        attrs: &AttributeMap,
        num_outputs: usize,
    ) -> Result<Vec<TensorId>> {
        let mut infos = Vec::with_capacity(inputs.len());
        for id in inputs {
            infos.push(self.tensor_info(id)?);
        }
        let consts: Vec<Option<Vec<i64>>> = inputs
            .iter()
            .map(|id| self.int_consts.get(id).cloned())
            .collect();

        let out_infos = infer_outputs(op_type, &infos, &consts, attrs, num_outputs)?;
        let mut outputs = Vec::with_capacity(num_outputs);
        for info in out_infos.into_iter().take(num_outputs) {
            let id = self.fresh_id(op_type);
            self.record_tensor(&id, info);
            outputs.push(id);
        }
        if outputs.len() != num_outputs {
            return Err(CompilerError::invalid(format!(
                "{} produces {} outputs, {} requested",
                op_type,
                outputs.len(),
                num_outputs
            )));
        }

        if op_type == "Constant" && attrs.get_int("dtype")? == DataType::Int64.code() {
            self.int_consts
                .insert(outputs[0].clone(), attrs.get_ints("value")?);
        }

        debug!(op = op_type, inputs = ?inputs, outputs = ?outputs, "program op");
        self.program.ops.push(ProgramOp {
            op_type: op_type.to_string(),
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
            attrs: attrs.clone(),
        });
        Ok(outputs)
    }

    fn add_output_tensor(&mut self, id: &TensorId) -> Result<()> {
        if !self.infos.contains_key(id) {
            return Err(CompilerError::not_found(format!("program tensor {}", id)));
        }
        self.program.outputs.push(id.clone());
        Ok(())
    }

    fn tensor_info(&self, id: &TensorId) -> Result<TensorInfo> {
        self.infos
            .get(id)
            .cloned()
            .ok_or_else(|| CompilerError::not_found(format!("program tensor {}", id)))
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        self.program.to_bytes()
    }
}
