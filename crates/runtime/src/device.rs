//! Device, session and step interfaces
//!
//! The runtime never talks to hardware directly. It goes through three
//! traits, each owning the next:
//!
//! ```text
//! ┌──────────────────────┐  acquire(n)   ┌────────────┐  create_session  ┌─────────────┐
//! │    DeviceManager     │ ────────────► │   Device   │ ───────────────► │   Session   │
//! │  - enumerate()       │               │  - detach  │                  │  - run      │
//! │  - device_info(id)   │               └────────────┘                  │  - weights  │
//! │  - model device      │                                               │  - export   │
//! └──────────────────────┘                                               └─────────────┘
//! ```
//!
//! [`crate::sim`] provides an in-process implementation of all three.

use crate::error::Result;
use crate::optimizer::OptimizerConfig;
use graft_compiler::{HostTensor, TensorId, TensorInfo};
use std::path::Path;

/// What a manager knows about one device id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: usize,
    /// Physical devices behind this handle
    pub num_devices: usize,
    /// Software model rather than hardware
    pub is_model: bool,
}

/// Discovery and acquisition of devices
pub trait DeviceManager: Send {
    /// Ids of every visible device
    fn enumerate(&self) -> Vec<usize>;

    fn device_info(&self, id: usize) -> Option<DeviceInfo>;

    /// Acquire a free group of `num_devices` devices, or `None` when no such
    /// group is available
    fn acquire(&mut self, num_devices: usize) -> Option<Box<dyn Device>>;

    /// Create a software model standing in for `num_devices` devices
    fn create_model_device(&mut self, num_devices: usize) -> Box<dyn Device>;
}

/// An acquired device
///
/// # Lifecycle
///
/// ```text
/// acquire ──► attached ──► create_session (any number) ──► detach
/// ```
///
/// Sessions created from a device keep working after the handle is dropped;
/// detaching only releases the device for other processes.
pub trait Device: Send {
    fn info(&self) -> DeviceInfo;

    fn is_attached(&self) -> bool;

    fn detach(&mut self);

    /// Build a session for the serialized program in `request`
    ///
    /// # Errors
    ///
    /// - `Unavailable` if the device was detached
    /// - `NotFound` if an anchor or the loss tensor is not in the program
    fn create_session(&self, request: SessionRequest<'_>) -> Result<Box<dyn Session>>;
}

/// How often an anchored output is returned within one device call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorReturn {
    /// Every batch of the step
    All,
    /// Only the last batch
    Final,
}

/// An output the host wants back from every step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub id: TensorId,
    pub return_type: AnchorReturn,
}

impl Anchor {
    pub fn all(id: impl Into<TensorId>) -> Self {
        Self {
            id: id.into(),
            return_type: AnchorReturn::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionMode {
    Inference,
    Training {
        /// Target id of the scalar loss
        loss: TensorId,
        optimizer: OptimizerConfig,
    },
}

/// Everything a device needs to build a session
#[derive(Debug, Clone)]
pub struct SessionRequest<'a> {
    pub program: &'a [u8],
    pub anchors: &'a [Anchor],
    pub batches_per_step: usize,
    /// Keep f32 weights as binary16 on the device
    pub fp16_weights: bool,
    pub mode: SessionMode,
}

/// Host buffers bound to one step
///
/// Output tensors must already be sized to the session's reported info.
pub struct StepIo<'a> {
    pub inputs: Vec<(TensorId, &'a HostTensor)>,
    pub outputs: Vec<(TensorId, &'a mut HostTensor)>,
}

/// A live program on a device
///
/// Weight transfers are two-phase: `write_weights` stages host bytes and
/// `weights_from_host` commits them; `weights_to_host` snapshots device
/// weights and `read_weights` copies them out.
pub trait Session: Send {
    /// Load the program onto the device; required before any transfer or run
    fn prepare_device(&mut self) -> Result<()>;

    /// Realized shape and element type of a device tensor
    fn tensor_info(&self, id: &str) -> Result<TensorInfo>;

    fn write_weights(&mut self, id: &str, data: &[u8]) -> Result<()>;

    fn weights_from_host(&mut self) -> Result<()>;

    fn weights_to_host(&mut self) -> Result<()>;

    fn read_weights(&self, id: &str, out: &mut [u8]) -> Result<()>;

    /// Execute one synchronous step
    fn run(&mut self, io: &mut StepIo<'_>) -> Result<()>;

    /// Replace the optimizer hyperparameters of a training session
    fn update_optimizer(&mut self, optimizer: &OptimizerConfig) -> Result<()>;

    /// Write a snapshot of the session's weights to `path`
    fn export_to_file(&self, path: &Path) -> Result<()>;
}
