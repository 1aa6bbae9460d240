//! Session manager: owns the live session and drives steps
//!
//! ```text
//!   uninitialized ──prepare──► prepared ──run──► running ──run──► ...
//!                                                  │
//!                                    every N steps (training)
//!                                                  ▼
//!                                   pull weights → host, snapshot
//! ```

use crate::config::Strategy;
use crate::device::{Anchor, Device, Session, SessionMode, SessionRequest, StepIo};
use crate::error::{Result, RuntimeError};
use crate::optimizer::{prefix_postfix, OptimizerDescriptor};
use crate::precision::{narrowed_copy, widen_in_place};
use crate::weights_io::WeightsIo;
use graft_compiler::{
    framework_dtype, DataType, HostTensor, Place, SymbolTable, TensorId, VarType, WeightStore,
};
use std::path::PathBuf;
use tracing::{debug, info};

/// Snapshot written right after preparation
pub const INIT_CHECKPOINT: &str = "checkpoint_init.bin";

/// Snapshot file written after pulling weights at `step`
pub fn step_checkpoint_name(step: u64) -> String {
    format!("checkpoint_step_{}.bin", step)
}

/// Owns one live session for the lifetime of a run
pub struct Executor {
    strategy: Strategy,
    optimizer: OptimizerDescriptor,
    /// Host names of the program's weights, in declaration order
    weights: Vec<String>,
    session: Option<Box<dyn Session>>,
    weights_io: WeightsIo,
    step: u64,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("strategy", &self.strategy)
            .field("optimizer", &self.optimizer)
            .field("weights", &self.weights)
            .field("prepared", &self.session.is_some())
            .field("step", &self.step)
            .finish()
    }
}

impl Executor {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            optimizer: OptimizerDescriptor::new(),
            weights: Vec::new(),
            session: None,
            weights_io: WeightsIo::new(),
            step: 0,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn set_optimizer_type(&mut self, kind: impl Into<String>) {
        self.optimizer.set_type(kind);
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.optimizer.set_lr(lr);
    }

    pub fn set_optimizer_attr(&mut self, name: impl Into<String>, value: f32) {
        self.optimizer.set_attr(name, value);
    }

    pub fn set_loss(&mut self, loss: impl Into<String>) {
        self.optimizer.set_loss(loss);
    }

    /// Host variable the learning rate is re-read from every training step
    pub fn set_lr_var_name(&mut self, name: impl Into<String>) {
        self.optimizer.set_lr_var_name(name);
    }

    pub fn set_weights(&mut self, weights: Vec<String>) {
        self.weights = weights;
    }

    pub fn optimizer(&self) -> &OptimizerDescriptor {
        &self.optimizer
    }

    /// Completed steps since the last `prepare`
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn is_prepared(&self) -> bool {
        self.session.is_some()
    }

    pub fn weights_io(&self) -> &WeightsIo {
        &self.weights_io
    }

    /// Create and load a session for `program`
    ///
    /// # Errors
    ///
    /// - `Config` when the strategy has a zero step count
    /// - `Unavailable` when `device` is `None`
    /// - `PreconditionNotMet` / `Unimplemented` from the optimizer (training)
    /// - `InvalidArgument` when the loss is not a compiled tensor (training)
    #[tracing::instrument(skip_all)]
    pub fn prepare(
        &mut self,
        program: &[u8],
        symbols: &SymbolTable,
        outputs: &[TensorId],
        device: Option<&dyn Device>,
        store: &dyn WeightStore,
    ) -> Result<()> {
        self.strategy.validate()?;
        let anchors: Vec<Anchor> = outputs.iter().cloned().map(Anchor::all).collect();

        let device = device.ok_or_else(|| {
            RuntimeError::Unavailable(
                "device is not attached, call attach_device(id) first".to_string(),
            )
        })?;

        let mode = if self.strategy.is_training {
            let optimizer = self.optimizer.build()?;
            let loss_name = self.optimizer.loss().unwrap_or_default();
            let loss = symbols.get(loss_name).cloned().ok_or_else(|| {
                RuntimeError::InvalidArgument(format!("loss {} does not exist", loss_name))
            })?;
            SessionMode::Training { loss, optimizer }
        } else {
            SessionMode::Inference
        };

        let mut session = device.create_session(SessionRequest {
            program,
            anchors: &anchors,
            batches_per_step: self.strategy.batches_per_step,
            fp16_weights: self.strategy.enable_fp16,
            mode,
        })?;
        session.prepare_device()?;

        self.weights_io = self.build_weights_io(session.as_ref(), store)?;
        self.write_weights(session.as_mut(), store)?;
        session.weights_from_host()?;

        if self.strategy.save_init_checkpoint {
            let path = self.checkpoint_path(INIT_CHECKPOINT)?;
            session.export_to_file(&path)?;
        }

        self.session = Some(session);
        self.step = 0;
        info!(
            training = self.strategy.is_training,
            transfers = self.weights_io.len(),
            "session prepared"
        );
        Ok(())
    }

    /// Pair every weight (and its optimizer state) with its host variable
    fn build_weights_io(&self, session: &dyn Session, store: &dyn WeightStore) -> Result<WeightsIo> {
        let kind = if self.strategy.is_training {
            self.optimizer.kind()
        } else {
            None
        };
        let mut io = WeightsIo::new();
        for weight in &self.weights {
            for (prefix, postfix) in prefix_postfix(kind) {
                let device_id = format!("{}{}", prefix, weight);
                let host_name = format!("{}{}", weight, postfix);
                if store.find(&host_name).is_none() {
                    debug!(host = %host_name, "no host variable, not transferred");
                    continue;
                }
                let info = session.tensor_info(&device_id)?;
                io.insert(device_id, host_name, info);
            }
        }
        Ok(io)
    }

    /// Stage every host weight, narrowing f32 to binary16 where the device
    /// holds half precision
    fn write_weights(&self, session: &mut dyn Session, store: &dyn WeightStore) -> Result<()> {
        for (id, entry) in self.weights_io.iter() {
            let host = store
                .find(&entry.host_name)
                .ok_or_else(|| RuntimeError::NotFound(format!("host weight {}", entry.host_name)))?;
            if narrows(entry.info.dtype, host) {
                session.write_weights(id, &narrowed_copy(host.data()))?;
            } else {
                session.write_weights(id, host.data())?;
            }
        }
        Ok(())
    }

    /// Pull device weights back into their host variables
    fn read_weights(&self, session: &mut dyn Session, store: &mut dyn WeightStore) -> Result<()> {
        session.weights_to_host()?;
        for (id, entry) in self.weights_io.iter() {
            let host = store
                .find_mut(&entry.host_name)
                .ok_or_else(|| RuntimeError::NotFound(format!("host weight {}", entry.host_name)))?;
            if narrows(entry.info.dtype, host) {
                let len = entry.info.size_in_bytes();
                let data = host.data_mut();
                if data.len() < len {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "host weight {} is smaller than its device copy",
                        entry.host_name
                    )));
                }
                session.read_weights(id, &mut data[..len])?;
                widen_in_place(data);
            } else {
                session.read_weights(id, host.data_mut())?;
            }
        }
        Ok(())
    }

    fn checkpoint_path(&self, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.strategy.checkpoint_dir)?;
        Ok(self.strategy.checkpoint_dir.join(name))
    }

    /// Run one step
    ///
    /// Outputs are resized to the session's realized shapes, with a leading
    /// `batches_per_step` dim when that is greater than 1, and allocated in
    /// `place`.
    #[tracing::instrument(skip_all, fields(step = self.step))]
    pub fn run(
        &mut self,
        input_ids: &[TensorId],
        inputs: &[&HostTensor],
        output_ids: &[TensorId],
        outputs: &mut [HostTensor],
        place: Place,
        store: &mut dyn WeightStore,
    ) -> Result<()> {
        let mut session = self.session.take().ok_or_else(|| {
            RuntimeError::PreconditionNotMet("executor is not prepared".to_string())
        })?;
        let result = self.step_session(
            session.as_mut(),
            input_ids,
            inputs,
            output_ids,
            outputs,
            place,
            store,
        );
        self.session = Some(session);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn step_session(
        &mut self,
        session: &mut dyn Session,
        input_ids: &[TensorId],
        inputs: &[&HostTensor],
        output_ids: &[TensorId],
        outputs: &mut [HostTensor],
        place: Place,
        store: &mut dyn WeightStore,
    ) -> Result<()> {
        if input_ids.len() != inputs.len() || output_ids.len() != outputs.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "{} input ids for {} inputs, {} output ids for {} outputs",
                input_ids.len(),
                inputs.len(),
                output_ids.len(),
                outputs.len()
            )));
        }

        let batches_per_step = self.strategy.batches_per_step;
        for (id, out) in output_ids.iter().zip(outputs.iter_mut()) {
            let info = session.tensor_info(id)?;
            let mut shape = info.shape;
            if batches_per_step > 1 {
                shape.insert(0, batches_per_step as i64);
            }
            out.resize(shape);
            out.alloc(place, framework_dtype(info.dtype)?);
        }

        if self.strategy.is_training {
            if let Some(lr) = self.lr_from_store(store)? {
                self.optimizer.set_lr(lr);
            }
            session.update_optimizer(&self.optimizer.build()?)?;
        }

        let mut io = StepIo {
            inputs: input_ids.iter().cloned().zip(inputs.iter().copied()).collect(),
            outputs: output_ids.iter().cloned().zip(outputs.iter_mut()).collect(),
        };
        session.run(&mut io)?;
        self.step += 1;

        if self.strategy.is_training && self.step % self.strategy.save_per_n_step as u64 == 0 {
            self.read_weights(session, store)?;
            if self.strategy.save_last_checkpoint {
                let path = self.checkpoint_path(&step_checkpoint_name(self.step))?;
                session.export_to_file(&path)?;
            }
            info!(step = self.step, "weights copied to host");
        }
        Ok(())
    }

    /// Current learning rate from the host, if a variable was named
    fn lr_from_store(&self, store: &dyn WeightStore) -> Result<Option<f32>> {
        let Some(name) = self.optimizer.lr_var_name() else {
            return Ok(None);
        };
        let var = store
            .find(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("learning rate variable {}", name)))?;
        if var.dtype() != VarType::Fp32 {
            return Err(RuntimeError::InvalidArgument(format!(
                "learning rate requires float32, found {}",
                var.dtype()
            )));
        }
        let values = var.to_f32_vec()?;
        let lr = values.first().copied().ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("learning rate variable {} is empty", name))
        })?;
        Ok(Some(lr))
    }
}

/// Device keeps binary16 for an f32 host tensor
fn narrows(device: DataType, host: &HostTensor) -> bool {
    device == DataType::Float16 && host.dtype() == VarType::Fp32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::device::DeviceManager;
    use crate::sim::SimDeviceManager;
    use graft_compiler::{ConstData, ProgramBuilder, ProgramRecorder, Scope, TensorInfo};

    struct Fixture {
        blob: Vec<u8>,
        symbols: SymbolTable,
        outputs: Vec<TensorId>,
    }

    /// `out = x + w`, loss bound to `out`
    fn fixture() -> Fixture {
        let mut recorder = ProgramRecorder::new();
        let x = recorder.add_input_tensor(TensorInfo::new(DataType::Float, vec![2, 3]), "x");
        let w = recorder
            .add_initialized_input_tensor(
                ConstData {
                    info: TensorInfo::new(DataType::Float, vec![2, 3]),
                    data: vec![0u8; 24],
                },
                "w",
            )
            .unwrap();
        let out = recorder.add_op("Add", &[x.clone(), w.clone()], &Default::default(), 1).unwrap();
        recorder.add_output_tensor(&out[0]).unwrap();

        let mut symbols = SymbolTable::new();
        symbols.insert("x", x);
        symbols.insert("w", w);
        symbols.insert("out", out[0].clone());
        Fixture {
            blob: recorder.serialize().unwrap(),
            symbols,
            outputs: out,
        }
    }

    fn store() -> Scope {
        let mut scope = Scope::new();
        scope.set("w", HostTensor::from_f32(vec![2, 3], &[1.0; 6]).unwrap());
        scope.set("lr", HostTensor::scalar_f32(0.25));
        scope
    }

    #[test]
    fn test_prepare_without_device_is_unavailable() {
        let f = fixture();
        let mut executor = Executor::new(Strategy::inference());
        let err = executor
            .prepare(&f.blob, &f.symbols, &f.outputs, None, &store())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert!(!executor.is_prepared());
    }

    #[test]
    fn test_zero_step_counts_are_config_errors() {
        let f = fixture();
        let mut manager = SimDeviceManager::new(1);
        let device = manager.acquire(1).unwrap();
        for strategy in [
            Strategy::training().with_save_per_n_step(0),
            Strategy::inference().with_batches_per_step(0),
        ] {
            let mut executor = Executor::new(strategy);
            executor.set_optimizer_type("sgd");
            executor.set_loss("out");
            let err = executor
                .prepare(&f.blob, &f.symbols, &f.outputs, Some(device.as_ref()), &store())
                .unwrap_err();
            assert!(matches!(err, RuntimeError::Config(ConfigError::Invalid(_))));
            assert!(!executor.is_prepared());

            let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
            let err = executor
                .run(&[], &[], &f.outputs, &mut outputs, Place::Cpu, &mut store())
                .unwrap_err();
            assert!(matches!(err, RuntimeError::PreconditionNotMet(_)));
        }
        assert_eq!(manager.stats().lock().sessions_created, 0);
    }

    #[test]
    fn test_unknown_loss_is_invalid_argument() {
        let f = fixture();
        let mut manager = SimDeviceManager::new(1);
        let device = manager.acquire(1).unwrap();
        let mut executor = Executor::new(Strategy::training());
        executor.set_optimizer_type("sgd");
        executor.set_loss("nope");
        let err = executor
            .prepare(&f.blob, &f.symbols, &f.outputs, Some(device.as_ref()), &store())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(ref m) if m.contains("nope")));
        assert_eq!(manager.stats().lock().sessions_created, 0);
    }

    #[test]
    fn test_batches_per_step_prefixes_output_shape() {
        let f = fixture();
        let mut manager = SimDeviceManager::new(1);
        let device = manager.acquire(1).unwrap();
        let mut executor = Executor::new(Strategy::inference().with_batches_per_step(4));
        let mut scope = store();
        executor
            .prepare(&f.blob, &f.symbols, &f.outputs, Some(device.as_ref()), &scope)
            .unwrap();

        let x = HostTensor::zeros(VarType::Fp32, vec![4, 2, 3]);
        let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
        executor
            .run(
                &["input:0".to_string()],
                &[&x],
                &f.outputs,
                &mut outputs,
                Place::Accelerator,
                &mut scope,
            )
            .unwrap();
        assert_eq!(outputs[0].shape(), &[4, 2, 3]);
        assert_eq!(outputs[0].place(), Place::Accelerator);
        assert_eq!(executor.step(), 1);
    }

    #[test]
    fn test_lr_is_read_from_host_every_step() {
        let f = fixture();
        let mut manager = SimDeviceManager::new(1);
        let stats = manager.stats();
        let device = manager.acquire(1).unwrap();
        let mut executor = Executor::new(Strategy::training().with_save_per_n_step(100));
        executor.set_optimizer_type("sgd");
        executor.set_loss("out");
        executor.set_lr_var_name("lr");
        executor.set_weights(vec!["w".to_string()]);
        let mut scope = store();
        executor
            .prepare(&f.blob, &f.symbols, &f.outputs, Some(device.as_ref()), &scope)
            .unwrap();
        assert_eq!(executor.weights_io().len(), 1);

        let x = HostTensor::zeros(VarType::Fp32, vec![2, 3]);
        let input_ids = vec!["input:0".to_string()];
        let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
        executor
            .run(&input_ids, &[&x], &f.outputs, &mut outputs, Place::Cpu, &mut scope)
            .unwrap();
        assert_eq!(stats.lock().last_lr, Some(0.25));

        scope.set("lr", HostTensor::scalar_f32(0.125));
        executor
            .run(&input_ids, &[&x], &f.outputs, &mut outputs, Place::Cpu, &mut scope)
            .unwrap();
        assert_eq!(stats.lock().last_lr, Some(0.125));

        scope.set("lr", HostTensor::from_i64(vec![1], &[1]).unwrap());
        let err = executor
            .run(&input_ids, &[&x], &f.outputs, &mut outputs, Place::Cpu, &mut scope)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn test_fp16_weights_round_trip_to_host() {
        let f = fixture();
        let mut manager = SimDeviceManager::new(1);
        let device = manager.acquire(1).unwrap();
        let mut executor = Executor::new(Strategy::training().with_fp16(true));
        executor.set_optimizer_type("sgd");
        executor.set_lr(0.5);
        executor.set_loss("out");
        executor.set_weights(vec!["w".to_string()]);
        let mut scope = store();
        executor
            .prepare(&f.blob, &f.symbols, &f.outputs, Some(device.as_ref()), &scope)
            .unwrap();
        assert_eq!(
            executor.weights_io().get("w").unwrap().info.dtype,
            DataType::Float16
        );

        let x = HostTensor::zeros(VarType::Fp32, vec![2, 3]);
        let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
        executor
            .run(
                &["input:0".to_string()],
                &[&x],
                &f.outputs,
                &mut outputs,
                Place::Cpu,
                &mut scope,
            )
            .unwrap();
        // one unit-gradient step at lr 0.5, pulled back and widened
        assert_eq!(scope.find("w").unwrap().to_f32_vec().unwrap(), vec![0.5; 6]);
    }

    #[test]
    fn test_adam_state_without_host_variables_is_skipped() {
        let f = fixture();
        let mut manager = SimDeviceManager::new(1);
        let device = manager.acquire(1).unwrap();
        let mut executor = Executor::new(Strategy::training());
        executor.set_optimizer_type("adam");
        executor.set_loss("out");
        executor.set_weights(vec!["w".to_string()]);
        let mut scope = store();
        scope.set("w_moment1_0", HostTensor::zeros(VarType::Fp32, vec![2, 3]));
        executor
            .prepare(&f.blob, &f.symbols, &f.outputs, Some(device.as_ref()), &scope)
            .unwrap();
        let ids: Vec<_> = executor.weights_io().ids().cloned().collect();
        assert_eq!(ids, vec!["w".to_string(), "Accl1___w".to_string()]);
    }
}
