//! # graft-runtime
//!
//! Drives programs built by `graft-compiler` on a device.
//!
//! ## Architecture
//!
//! ```text
//! Backend ─┬─ DeviceManager → Device      (discovery, attachment)
//!          ├─ Compiler                     (graft-compiler)
//!          └─ Executor ── Session          (weights, optimizer, steps, snapshots)
//! ```
//!
//! [`sim`] implements the device traits in-process for tests and model runs.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod optimizer;
pub mod precision;
pub mod sim;
pub mod weights_io;

pub use backend::{upper_device_num, Backend, COMPILED_PROGRAM_FILE, MODEL_DEVICE_ENV};
pub use config::{ConfigError, Strategy};
pub use device::{
    Anchor, AnchorReturn, Device, DeviceInfo, DeviceManager, Session, SessionMode,
    SessionRequest, StepIo,
};
pub use error::{Result, RuntimeError};
pub use executor::{step_checkpoint_name, Executor, INIT_CHECKPOINT};
pub use optimizer::{prefix_postfix, OptimizerConfig, OptimizerDescriptor};
pub use precision::{narrow_in_place, widen_in_place};
pub use sim::{SessionSnapshot, SimDevice, SimDeviceManager, SimStats};
pub use weights_io::{WeightsIo, WeightsIoEntry};
