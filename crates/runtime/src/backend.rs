//! Backend façade: device attachment, compilation and stepping in one place
//!
//! # Example
//!
//! ```
//! use graft_compiler::{Graph, HostTensor, Scope, VarType};
//! use graft_runtime::{Backend, SimDeviceManager, Strategy};
//!
//! let mut graph = Graph::new();
//! graph.add_var("x").shape(vec![2]).dtype(VarType::Fp32).finish();
//! graph.add_op("relu").input("X", &["x"]).output("Out", &["y"]).finish()?;
//!
//! let dir = std::env::temp_dir().join("graft-backend-doc");
//! let strategy = Strategy::inference().with_checkpoint_dir(&dir);
//! let mut backend = Backend::new(strategy, Box::new(SimDeviceManager::new(1)));
//! backend.attach_device(0)?;
//!
//! let mut scope = Scope::new();
//! backend.compile(&mut graph, &["x"], &["y"], &scope)?;
//!
//! let x = HostTensor::from_f32(vec![2], &[-1.0, 1.0])?;
//! let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
//! backend.run(&[&x], &mut outputs, &mut scope)?;
//! assert_eq!(outputs[0].shape(), &[2]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::Strategy;
use crate::device::{Device, DeviceInfo, DeviceManager};
use crate::error::{Result, RuntimeError};
use crate::executor::Executor;
use graft_compiler::{
    CompiledProgram, Compiler, Graph, HostTensor, LoweringRegistry, Place, WeightStore,
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Environment switch forcing model-device mode
pub const MODEL_DEVICE_ENV: &str = "GRAFT_MODEL_DEVICE";

/// Compiled program file written by `prepare`
pub const COMPILED_PROGRAM_FILE: &str = "model_compiled.bin";

/// Smallest power of two ≥ `requested`
///
/// # Errors
///
/// `Unavailable` when `requested` is not positive.
pub fn upper_device_num(requested: i64) -> Result<usize> {
    if requested <= 0 {
        return Err(RuntimeError::Unavailable(format!(
            "device count must be positive, got {}",
            requested
        )));
    }
    Ok((requested as usize).next_power_of_two())
}

fn model_device_from_env() -> bool {
    std::env::var(MODEL_DEVICE_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub struct Backend {
    strategy: Strategy,
    manager: Box<dyn DeviceManager>,
    device: Option<Box<dyn Device>>,
    compiler: Option<Compiler>,
    program: Option<CompiledProgram>,
    executor: Executor,
    is_prepared: bool,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("strategy", &self.strategy)
            .field("device", &self.device.as_ref().map(|d| d.info()))
            .field("compiled", &self.program.is_some())
            .field("is_prepared", &self.is_prepared)
            .finish()
    }
}

impl Backend {
    pub fn new(strategy: Strategy, manager: Box<dyn DeviceManager>) -> Self {
        Self {
            executor: Executor::new(strategy.clone()),
            strategy,
            manager,
            device: None,
            compiler: None,
            program: None,
            is_prepared: false,
        }
    }

    /// Process-wide backend, built by `init` on first call
    ///
    /// Later calls return the same instance and never run `init`.
    pub fn get_instance(init: impl FnOnce() -> Backend) -> Arc<Mutex<Backend>> {
        static INSTANCE: OnceLock<Arc<Mutex<Backend>>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(Mutex::new(init()))).clone()
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    fn model_device_mode(&self) -> bool {
        self.strategy.use_model_device || model_device_from_env()
    }

    pub fn num_devices(&self) -> Result<usize> {
        if self.model_device_mode() {
            return Ok(1);
        }
        let count = self.manager.enumerate().len();
        if count == 0 {
            return Err(RuntimeError::Unavailable(
                "no devices found; enable the device runtime or set `use_model_device`"
                    .to_string(),
            ));
        }
        Ok(count)
    }

    pub fn device_ids(&self) -> Result<Vec<usize>> {
        if self.model_device_mode() {
            return Ok(vec![0]);
        }
        self.num_devices()?;
        Ok(self.manager.enumerate())
    }

    pub fn device_info(&self, id: usize) -> Result<DeviceInfo> {
        let count = self.num_devices()?;
        if id >= count {
            return Err(RuntimeError::InvalidArgument(format!(
                "device id {} is invalid, number of devices is {}",
                id, count
            )));
        }
        if self.model_device_mode() {
            return Ok(DeviceInfo {
                id,
                num_devices: 1,
                is_model: true,
            });
        }
        self.manager
            .device_info(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("device {}", id)))
    }

    /// Acquire `num_devices` (rounded up to a power of two) devices
    ///
    /// `id` must name a visible device. Attaching while attached is a no-op.
    #[tracing::instrument(skip(self))]
    pub fn attach_device(&mut self, id: usize) -> Result<()> {
        if self.is_attached() {
            debug!("device already attached");
            return Ok(());
        }
        self.device_info(id)?;
        let wanted = upper_device_num(self.strategy.num_devices as i64)?;

        let device = if self.model_device_mode() {
            self.manager.create_model_device(wanted)
        } else {
            self.manager.acquire(wanted).ok_or_else(|| {
                RuntimeError::Unavailable(format!("cannot acquire {} device(s)", wanted))
            })?
        };
        info!(devices = wanted, model = device.info().is_model, "device attached");
        self.device = Some(device);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_attached())
    }

    /// Release the attached device; sessions keep their handles
    pub fn detach_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            if device.is_attached() {
                device.detach();
                info!("device detached");
            }
        }
    }

    /// Canonicalize and lower `graph`, replacing any earlier compile
    #[tracing::instrument(skip_all)]
    pub fn compile<S: AsRef<str>>(
        &mut self,
        graph: &mut Graph,
        feeds: &[S],
        fetches: &[S],
        store: &dyn WeightStore,
    ) -> Result<&CompiledProgram> {
        let mut compiler = Compiler::new(LoweringRegistry::global())
            .with_feed_policy(self.strategy.feed_policy);
        let program = compiler.compile(graph, feeds, fetches, Some(store))?;
        info!("{}", compiler.stats());

        self.executor.set_weights(compiler.weights().to_vec());
        self.compiler = Some(compiler);
        self.is_prepared = false;
        Ok(self.program.insert(program))
    }

    pub fn program(&self) -> Option<&CompiledProgram> {
        self.program.as_ref()
    }

    pub fn compiler(&self) -> Option<&Compiler> {
        self.compiler.as_ref()
    }

    /// Compiled shape of `name`, with a leading `batches_per_step` dim
    pub fn tensor_shape(&self, name: &str) -> Result<Vec<i64>> {
        let compiler = self.compiler.as_ref().ok_or_else(|| {
            RuntimeError::PreconditionNotMet("nothing has been compiled".to_string())
        })?;
        let mut shape = compiler.tensor_info(name)?.shape;
        shape.insert(0, self.strategy.batches_per_step as i64);
        Ok(shape)
    }

    /// Executor for setting optimizer state before the first `run`
    pub fn executor_mut(&mut self) -> &mut Executor {
        &mut self.executor
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Save the compiled program and create the session
    #[tracing::instrument(skip_all)]
    pub fn prepare(&mut self, store: &dyn WeightStore) -> Result<()> {
        let (compiler, program) = match (&self.compiler, &self.program) {
            (Some(compiler), Some(program)) => (compiler, program),
            _ => {
                return Err(RuntimeError::PreconditionNotMet(
                    "compile must be called before prepare".to_string(),
                ))
            }
        };
        self.strategy.validate()?;
        std::fs::create_dir_all(&self.strategy.checkpoint_dir)?;
        compiler.save_program(self.strategy.checkpoint_dir.join(COMPILED_PROGRAM_FILE))?;

        self.executor.prepare(
            &program.blob,
            compiler.tensors(),
            &program.outputs,
            self.device.as_deref(),
            store,
        )?;
        self.is_prepared = true;
        Ok(())
    }

    /// One step; prepares on first use
    ///
    /// `inputs` follow the compiled input order, `outputs` the fetch order.
    pub fn run(
        &mut self,
        inputs: &[&HostTensor],
        outputs: &mut [HostTensor],
        store: &mut dyn WeightStore,
    ) -> Result<()> {
        if !self.is_prepared {
            self.prepare(&*store)?;
        }
        let program = self.program.as_ref().ok_or_else(|| {
            RuntimeError::PreconditionNotMet("compile must be called before run".to_string())
        })?;
        self.executor.run(
            &program.inputs,
            inputs,
            &program.outputs,
            outputs,
            Place::Cpu,
            store,
        )
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.is_attached() {
            warn!("backend dropped with a device attached, detaching");
            self.detach_device();
        }
    }
}
