//! Host-side tensors and the weight store they live in

use crate::dtype::VarType;
use crate::error::{CompilerError, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Where a host tensor's buffer is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Place {
    #[default]
    Cpu,
    /// Host memory pinned for the accelerator
    Accelerator,
}

/// Dense tensor in host memory: element type, shape and a raw native-endian buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    dtype: VarType,
    shape: Vec<i64>,
    data: Vec<u8>,
    place: Place,
}

/// Element count of a shape; unknown (negative) dims count as zero
pub fn numel(shape: &[i64]) -> usize {
    shape.iter().map(|&d| d.max(0) as usize).product()
}

impl HostTensor {
    /// Zero-filled tensor
    pub fn zeros(dtype: VarType, shape: Vec<i64>) -> Self {
        let len = numel(&shape) * dtype.size_in_bytes();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
            place: Place::Cpu,
        }
    }

    /// Tensor with no storage yet; [`alloc`](Self::alloc) sizes it later
    pub fn empty(dtype: VarType) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
            data: Vec::new(),
            place: Place::Cpu,
        }
    }

    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Result<Self> {
        Self::from_pod(VarType::Fp32, shape, values)
    }

    pub fn from_i64(shape: Vec<i64>, values: &[i64]) -> Result<Self> {
        Self::from_pod(VarType::Int64, shape, values)
    }

    /// Rank-1 single-element f32 tensor, the shape learning-rate variables use
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            dtype: VarType::Fp32,
            shape: vec![1],
            data: bytemuck::bytes_of(&value).to_vec(),
            place: Place::Cpu,
        }
    }

    fn from_pod<T: bytemuck::Pod>(dtype: VarType, shape: Vec<i64>, values: &[T]) -> Result<Self> {
        if numel(&shape) != values.len() {
            return Err(CompilerError::invalid(format!(
                "shape {:?} holds {} elements, got {}",
                shape,
                numel(&shape),
                values.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data: bytemuck::cast_slice(values).to_vec(),
            place: Place::Cpu,
        })
    }

    pub fn dtype(&self) -> VarType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Change the logical shape without touching storage
    pub fn resize(&mut self, shape: Vec<i64>) {
        self.shape = shape;
    }

    /// (Re)allocate zeroed storage for the current shape in `place`
    pub fn alloc(&mut self, place: Place, dtype: VarType) {
        self.dtype = dtype;
        self.place = place;
        self.data = vec![0u8; self.numel() * dtype.size_in_bytes()];
    }

    /// Copy the buffer out as f32 values
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != VarType::Fp32 {
            return Err(CompilerError::invalid(format!(
                "expected float32 tensor, found {}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect())
    }

    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        if self.dtype != VarType::Int64 {
            return Err(CompilerError::invalid(format!(
                "expected int64 tensor, found {}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned::<i64>)
            .collect())
    }
}

/// Host weight storage, looked up by variable name
pub trait WeightStore {
    fn find(&self, name: &str) -> Option<&HostTensor>;
    fn find_mut(&mut self, name: &str) -> Option<&mut HostTensor>;
}

/// In-memory [`WeightStore`]
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: FxHashMap<String, HostTensor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variable
    pub fn set(&mut self, name: impl Into<String>, tensor: HostTensor) -> Option<HostTensor> {
        self.vars.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<HostTensor> {
        self.vars.remove(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variable names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.vars.keys().cloned().collect();
        names.sort();
        names
    }
}

impl WeightStore for Scope {
    fn find(&self, name: &str) -> Option<&HostTensor> {
        self.vars.get(name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut HostTensor> {
        self.vars.get_mut(name)
    }
}
