//! # graft
//!
//! Lowers framework computation graphs into accelerator programs and drives
//! them through training or inference sessions.
//!
//! ## Library Usage
//!
//! ```
//! use graft::prelude::*;
//!
//! let mut graph = Graph::new();
//! graph.add_var("x").shape(vec![1, 4]).dtype(VarType::Fp32).finish();
//! graph.add_op("sigmoid").input("X", &["x"]).output("Out", &["y"]).finish()?;
//!
//! let dir = std::env::temp_dir().join("graft-facade-doc");
//! let strategy = Strategy::inference().with_checkpoint_dir(&dir);
//! let mut backend = Backend::new(strategy, Box::new(SimDeviceManager::new(1)));
//! backend.attach_device(0)?;
//!
//! let mut scope = Scope::new();
//! backend.compile(&mut graph, &["x"], &["y"], &scope)?;
//! let x = HostTensor::from_f32(vec![1, 4], &[0.0; 4])?;
//! let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
//! backend.run(&[&x], &mut outputs, &mut scope)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Crates
//!
//! - [`compiler`]: graph IR, canonicalization, lowering, program builder
//! - [`runtime`]: strategy, devices, sessions, executor, backend

pub use graft_compiler as compiler;
pub use graft_runtime as runtime;

pub use graft_compiler::{
    CompiledProgram, Compiler, CompilerError, FeedPolicy, Graph, HostTensor, LoweringRegistry,
    Place, RewriteRegistry, Scope, VarType, WeightStore,
};
pub use graft_runtime::{Backend, Executor, RuntimeError, SimDeviceManager, Strategy};

/// Common imports
pub mod prelude {
    pub use graft_compiler::{
        CompiledProgram, Compiler, FeedPolicy, Graph, HostTensor, LoweringRegistry, Place, Scope,
        VarType, WeightStore,
    };
    pub use graft_runtime::{
        Backend, Device, DeviceManager, Executor, SimDeviceManager, Strategy,
    };
}

/// Get the version of graft
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
