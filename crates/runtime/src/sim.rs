//! In-process simulated devices
//!
//! [`SimDeviceManager`] hands out [`SimDevice`]s whose sessions keep weights in
//! host memory and count every call in a shared [`SimStats`]. Sessions never
//! execute the program: a step validates its bindings and, when training,
//! moves every host-written weight by `-lr` so transfers are observable.

use crate::device::{
    Device, DeviceInfo, DeviceManager, Session, SessionMode, SessionRequest, StepIo,
};
use crate::error::{Result, RuntimeError};
use crate::optimizer::{prefix_postfix, OptimizerConfig};
use crate::precision::narrowed_copy;
use graft_compiler::{DataType, TargetProgram, TensorId, TensorInfo};
use half::f16;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Device tensors holding one scalar per weight
const STEP_PREFIX: &str = "Step___";

/// Call counters shared by a manager and everything it creates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimStats {
    pub attached: usize,
    pub detached: usize,
    pub sessions_created: usize,
    pub training_sessions: usize,
    pub prepare_device: usize,
    pub weights_written: usize,
    pub weights_from_host: usize,
    pub weights_to_host: usize,
    pub weights_read: usize,
    pub runs: usize,
    pub optimizer_updates: usize,
    pub last_lr: Option<f32>,
    /// Snapshot paths, in export order
    pub exports: Vec<PathBuf>,
}

pub type SharedStats = Arc<Mutex<SimStats>>;

/// Manager over `num_devices` simulated devices
#[derive(Debug)]
pub struct SimDeviceManager {
    num_devices: usize,
    stats: SharedStats,
}

impl SimDeviceManager {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            stats: SharedStats::default(),
        }
    }

    /// Counters of this manager, its devices and their sessions
    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    fn device(&self, num_devices: usize, is_model: bool) -> Box<dyn Device> {
        self.stats.lock().attached += 1;
        Box::new(SimDevice {
            info: DeviceInfo {
                id: 0,
                num_devices,
                is_model,
            },
            attached: true,
            stats: self.stats.clone(),
        })
    }
}

impl DeviceManager for SimDeviceManager {
    fn enumerate(&self) -> Vec<usize> {
        (0..self.num_devices).collect()
    }

    fn device_info(&self, id: usize) -> Option<DeviceInfo> {
        (id < self.num_devices).then_some(DeviceInfo {
            id,
            num_devices: 1,
            is_model: false,
        })
    }

    fn acquire(&mut self, num_devices: usize) -> Option<Box<dyn Device>> {
        if num_devices == 0 || num_devices > self.num_devices {
            return None;
        }
        Some(self.device(num_devices, false))
    }

    fn create_model_device(&mut self, num_devices: usize) -> Box<dyn Device> {
        self.device(num_devices, true)
    }
}

#[derive(Debug)]
pub struct SimDevice {
    info: DeviceInfo,
    attached: bool,
    stats: SharedStats,
}

impl Device for SimDevice {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    fn detach(&mut self) {
        if self.attached {
            self.attached = false;
            self.stats.lock().detached += 1;
        }
    }

    fn create_session(&self, request: SessionRequest<'_>) -> Result<Box<dyn Session>> {
        if !self.attached {
            return Err(RuntimeError::Unavailable(
                "device is not attached".to_string(),
            ));
        }
        let program = TargetProgram::from_bytes(request.program)?;

        for anchor in request.anchors {
            if program.tensor_info(&anchor.id).is_none() {
                return Err(RuntimeError::NotFound(format!(
                    "anchor {} is not a program tensor",
                    anchor.id
                )));
            }
        }
        let optimizer = match &request.mode {
            SessionMode::Inference => None,
            SessionMode::Training { loss, optimizer } => {
                if program.tensor_info(loss).is_none() {
                    return Err(RuntimeError::NotFound(format!(
                        "loss {} is not a program tensor",
                        loss
                    )));
                }
                Some(*optimizer)
            }
        };

        let mut weights = BTreeMap::new();
        for init in &program.initializers {
            let mut info = init.data.info.clone();
            let data = if request.fp16_weights && info.dtype == DataType::Float {
                info.dtype = DataType::Float16;
                narrowed_copy(&init.data.data)
            } else {
                init.data.data.clone()
            };
            weights.insert(init.id.clone(), DeviceTensor { info, data });
        }

        {
            let mut stats = self.stats.lock();
            stats.sessions_created += 1;
            if optimizer.is_some() {
                stats.training_sessions += 1;
            }
        }
        info!(
            training = optimizer.is_some(),
            weights = weights.len(),
            anchors = request.anchors.len(),
            "created simulated session"
        );

        Ok(Box::new(SimSession {
            anchors: request.anchors.iter().map(|a| a.id.clone()).collect(),
            program,
            batches_per_step: request.batches_per_step.max(1),
            optimizer,
            prepared: false,
            weights,
            staged: BTreeMap::new(),
            pulled: BTreeMap::new(),
            host_written: BTreeSet::new(),
            step: 0,
            stats: self.stats.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
struct DeviceTensor {
    info: TensorInfo,
    data: Vec<u8>,
}

/// Session state written by [`Session::export_to_file`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub step: u64,
    /// Device bytes of every weight
    pub weights: BTreeMap<TensorId, Vec<u8>>,
    pub optimizer: Option<OptimizerConfig>,
}

impl SessionSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| RuntimeError::Snapshot(format!("serialization failed: {}", e)))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes)
            .map_err(|e| RuntimeError::Snapshot(format!("deserialization failed: {}", e)))
    }
}

pub struct SimSession {
    program: TargetProgram,
    anchors: Vec<TensorId>,
    batches_per_step: usize,
    optimizer: Option<OptimizerConfig>,
    prepared: bool,
    weights: BTreeMap<TensorId, DeviceTensor>,
    staged: BTreeMap<TensorId, Vec<u8>>,
    pulled: BTreeMap<TensorId, Vec<u8>>,
    /// Weights the host wrote without an optimizer prefix
    host_written: BTreeSet<TensorId>,
    step: u64,
    stats: SharedStats,
}

impl SimSession {
    fn require_prepared(&self) -> Result<()> {
        if !self.prepared {
            return Err(RuntimeError::PreconditionNotMet(
                "session device not prepared".to_string(),
            ));
        }
        Ok(())
    }

    /// Split an optimizer-state id into its prefix and weight
    fn optimizer_state<'a>(&self, id: &'a str) -> Option<(&'static str, &'a str)> {
        let kind = self.optimizer.as_ref().map(OptimizerConfig::kind)?;
        prefix_postfix(Some(kind))
            .iter()
            .filter(|(prefix, _)| !prefix.is_empty())
            .find_map(|(prefix, _)| id.strip_prefix(prefix).map(|weight| (*prefix, weight)))
    }

    /// One step of plain descent with a unit gradient
    fn apply_unit_gradient(&mut self, lr: f32) {
        for id in &self.host_written {
            let Some(tensor) = self.weights.get_mut(id) else {
                continue;
            };
            match tensor.info.dtype {
                DataType::Float => {
                    for chunk in tensor.data.chunks_exact_mut(4) {
                        let value = bytemuck::pod_read_unaligned::<f32>(chunk) - lr;
                        chunk.copy_from_slice(bytemuck::bytes_of(&value));
                    }
                }
                DataType::Float16 => {
                    for chunk in tensor.data.chunks_exact_mut(2) {
                        let bits = bytemuck::pod_read_unaligned::<u16>(chunk);
                        let value = f16::from_f32(f16::from_bits(bits).to_f32() - lr);
                        chunk.copy_from_slice(&value.to_bits().to_ne_bytes());
                    }
                }
                _ => {}
            }
        }
    }
}

impl Session for SimSession {
    fn prepare_device(&mut self) -> Result<()> {
        self.prepared = true;
        self.stats.lock().prepare_device += 1;
        Ok(())
    }

    fn tensor_info(&self, id: &str) -> Result<TensorInfo> {
        if let Some(tensor) = self.weights.get(id) {
            return Ok(tensor.info.clone());
        }
        if let Some((prefix, weight)) = self.optimizer_state(id) {
            let base = self
                .weights
                .get(weight)
                .ok_or_else(|| RuntimeError::NotFound(format!("tensor {}", id)))?;
            let shape = if prefix == STEP_PREFIX {
                vec![1]
            } else {
                base.info.shape.clone()
            };
            return Ok(TensorInfo::new(DataType::Float, shape));
        }
        self.program
            .tensor_info(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("tensor {}", id)))
    }

    fn write_weights(&mut self, id: &str, data: &[u8]) -> Result<()> {
        let info = self.tensor_info(id)?;
        if data.len() != info.size_in_bytes() {
            return Err(RuntimeError::InvalidArgument(format!(
                "weight {} expects {} bytes ({}), got {}",
                id,
                info.size_in_bytes(),
                info,
                data.len()
            )));
        }
        if !self.weights.contains_key(id) {
            self.weights.insert(
                id.to_string(),
                DeviceTensor {
                    info,
                    data: Vec::new(),
                },
            );
        }
        if self.optimizer_state(id).is_none() {
            self.host_written.insert(id.to_string());
        }
        self.staged.insert(id.to_string(), data.to_vec());
        self.stats.lock().weights_written += 1;
        Ok(())
    }

    fn weights_from_host(&mut self) -> Result<()> {
        self.require_prepared()?;
        for (id, data) in std::mem::take(&mut self.staged) {
            if let Some(tensor) = self.weights.get_mut(&id) {
                tensor.data = data;
            }
        }
        self.stats.lock().weights_from_host += 1;
        Ok(())
    }

    fn weights_to_host(&mut self) -> Result<()> {
        self.require_prepared()?;
        self.pulled = self
            .weights
            .iter()
            .map(|(id, tensor)| (id.clone(), tensor.data.clone()))
            .collect();
        self.stats.lock().weights_to_host += 1;
        Ok(())
    }

    fn read_weights(&self, id: &str, out: &mut [u8]) -> Result<()> {
        let data = self.pulled.get(id).ok_or_else(|| {
            RuntimeError::NotFound(format!("weight {} has not been copied to the host", id))
        })?;
        if out.len() != data.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "weight {} holds {} bytes, buffer has {}",
                id,
                data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(data);
        self.stats.lock().weights_read += 1;
        Ok(())
    }

    fn run(&mut self, io: &mut StepIo<'_>) -> Result<()> {
        self.require_prepared()?;
        for (id, _) in &io.inputs {
            if !self.program.inputs.contains(id) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "{} is not a program input",
                    id
                )));
            }
        }
        for (id, tensor) in &io.outputs {
            if !self.anchors.contains(id) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "{} is not anchored",
                    id
                )));
            }
            let expected = self.tensor_info(id)?.size_in_bytes() * self.batches_per_step;
            if tensor.data().len() != expected {
                return Err(RuntimeError::InvalidArgument(format!(
                    "output {} buffer holds {} bytes, expected {}",
                    id,
                    tensor.data().len(),
                    expected
                )));
            }
        }

        if let Some(lr) = self.optimizer.as_ref().map(OptimizerConfig::lr) {
            self.apply_unit_gradient(lr);
        }
        self.step += 1;
        self.stats.lock().runs += 1;
        debug!(step = self.step, "simulated step");
        Ok(())
    }

    fn update_optimizer(&mut self, optimizer: &OptimizerConfig) -> Result<()> {
        if self.optimizer.is_none() {
            return Err(RuntimeError::PreconditionNotMet(
                "inference sessions have no optimizer".to_string(),
            ));
        }
        self.optimizer = Some(*optimizer);
        let mut stats = self.stats.lock();
        stats.optimizer_updates += 1;
        stats.last_lr = Some(optimizer.lr());
        Ok(())
    }

    fn export_to_file(&self, path: &Path) -> Result<()> {
        let snapshot = SessionSnapshot {
            step: self.step,
            weights: self
                .weights
                .iter()
                .map(|(id, tensor)| (id.clone(), tensor.data.clone()))
                .collect(),
            optimizer: self.optimizer,
        };
        snapshot.save(path)?;
        self.stats.lock().exports.push(path.to_path_buf());
        debug!(path = %path.display(), "exported session snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Anchor;
    use graft_compiler::{ConstData, ProgramBuilder, ProgramRecorder};

    /// Program computing `y = Relu(x)` with one weight `w`
    fn program() -> Vec<u8> {
        let mut recorder = ProgramRecorder::new();
        let x = recorder.add_input_tensor(TensorInfo::new(DataType::Float, vec![2]), "x");
        let w = recorder
            .add_initialized_input_tensor(
                ConstData {
                    info: TensorInfo::new(DataType::Float, vec![2]),
                    data: bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0]).to_vec(),
                },
                "w",
            )
            .unwrap();
        let sum = recorder.add_op("Add", &[x, w], &Default::default(), 1).unwrap();
        let y = recorder.add_op("Relu", &sum, &Default::default(), 1).unwrap();
        recorder.add_output_tensor(&y[0]).unwrap();
        recorder.serialize().unwrap()
    }

    fn sgd() -> SessionMode {
        SessionMode::Training {
            loss: "w".to_string(),
            optimizer: OptimizerConfig::Sgd { lr: 0.5 },
        }
    }

    fn session(device: &SimDevice, mode: SessionMode, fp16: bool) -> Box<dyn Session> {
        let blob = program();
        device
            .create_session(SessionRequest {
                program: &blob,
                anchors: &[],
                batches_per_step: 1,
                fp16_weights: fp16,
                mode,
            })
            .unwrap()
    }

    fn device() -> (Box<dyn Device>, SharedStats) {
        let mut manager = SimDeviceManager::new(2);
        let stats = manager.stats();
        (manager.acquire(1).unwrap(), stats)
    }

    #[test]
    fn test_acquire_respects_device_count() {
        let mut manager = SimDeviceManager::new(2);
        assert_eq!(manager.enumerate(), vec![0, 1]);
        assert!(manager.acquire(4).is_none());
        assert!(manager.acquire(2).is_some());
        assert!(manager.device_info(2).is_none());
        assert!(manager.create_model_device(1).info().is_model);
        assert_eq!(manager.stats().lock().attached, 2);
    }

    #[test]
    fn test_detached_device_is_unavailable() {
        let (mut device, stats) = device();
        device.detach();
        device.detach();
        let blob = program();
        let err = device
            .create_session(SessionRequest {
                program: &blob,
                anchors: &[Anchor::all("missing")],
                batches_per_step: 1,
                fp16_weights: false,
                mode: SessionMode::Inference,
            })
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert_eq!(stats.lock().detached, 1);
    }

    #[test]
    fn test_weights_round_trip_through_device() {
        let device = SimDevice {
            info: DeviceInfo {
                id: 0,
                num_devices: 1,
                is_model: true,
            },
            attached: true,
            stats: SharedStats::default(),
        };
        let mut session = session(&device, sgd(), false);
        session.prepare_device().unwrap();

        let new = bytemuck::cast_slice::<f32, u8>(&[3.0, 4.0]).to_vec();
        session.write_weights("w", &new).unwrap();
        assert!(session.write_weights("w", &new[..4]).is_err());
        session.weights_from_host().unwrap();
        session.run(&mut StepIo { inputs: vec![], outputs: vec![] }).unwrap();
        session.weights_to_host().unwrap();

        let mut out = vec![0u8; 8];
        session.read_weights("w", &mut out).unwrap();
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        assert_eq!(values, vec![2.5, 3.5]);
    }

    #[test]
    fn test_fp16_weights_and_optimizer_state() {
        let device = SimDevice {
            info: DeviceInfo {
                id: 0,
                num_devices: 1,
                is_model: true,
            },
            attached: true,
            stats: SharedStats::default(),
        };
        let adam = SessionMode::Training {
            loss: "w".to_string(),
            optimizer: OptimizerConfig::Adam {
                lr: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
        };
        let session = session(&device, adam, true);
        assert_eq!(session.tensor_info("w").unwrap().dtype, DataType::Float16);
        assert_eq!(
            session.tensor_info("Accl1___w").unwrap(),
            TensorInfo::new(DataType::Float, vec![2])
        );
        assert_eq!(session.tensor_info("Step___w").unwrap().shape, vec![1]);
        assert!(session.tensor_info("Accl1___nope").is_err());
    }

    #[test]
    fn test_inference_session_rejects_optimizer_and_unprepared_run() {
        let (device, _) = device();
        let mut session = session_from(&*device);
        assert!(matches!(
            session.run(&mut StepIo { inputs: vec![], outputs: vec![] }),
            Err(RuntimeError::PreconditionNotMet(_))
        ));
        assert!(session
            .update_optimizer(&OptimizerConfig::Sgd { lr: 1.0 })
            .is_err());
    }

    fn session_from(device: &dyn Device) -> Box<dyn Session> {
        let blob = program();
        device
            .create_session(SessionRequest {
                program: &blob,
                anchors: &[],
                batches_per_step: 1,
                fp16_weights: false,
                mode: SessionMode::Inference,
            })
            .unwrap()
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        let snapshot = SessionSnapshot {
            step: 7,
            weights: BTreeMap::from([("w".to_string(), vec![1, 2, 3])]),
            optimizer: Some(OptimizerConfig::Sgd { lr: 0.1 }),
        };
        snapshot.save(&path).unwrap();
        assert_eq!(SessionSnapshot::load(&path).unwrap(), snapshot);
    }
}
