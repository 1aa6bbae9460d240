//! # graft-compiler
//!
//! Lowers framework computation graphs into target accelerator programs.
//!
//! ## Pipeline
//!
//! ```text
//! framework Graph (petgraph)
//!     ↓
//! 1. Canonicalize → framework ops rewritten into the canonical vocabulary
//!     ↓
//! 2. Declare      → feeds become program inputs, weights become initializers
//!     ↓
//! 3. Lower        → canonical ops emitted in topological order
//!     ↓
//! 4. Export       → serialized program + ordered input/output ids
//! ```
//!
//! ## Example
//!
//! ```
//! use graft_compiler::{Compiler, Graph, LoweringRegistry, Scope, VarType, WeightStore};
//!
//! let mut graph = Graph::new();
//! graph.add_var("x").shape(vec![-1, 16]).dtype(VarType::Fp32).finish();
//! graph.add_op("relu").input("X", &["x"]).output("Out", &["y"]).finish()?;
//!
//! let scope = Scope::new();
//! let mut compiler = Compiler::new(LoweringRegistry::global());
//! let program = compiler.compile(&mut graph, &["x"], &["y"], Some(&scope as &dyn WeightStore))?;
//! assert_eq!(program.inputs.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod attrs;
pub mod canonical;
pub mod compiler;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod program;
pub mod registry;
pub mod symbols;
pub mod tensor;
pub mod vocab;

pub use attrs::{AttrValue, AttributeMap};
pub use canonical::{
    CanonicalizeStats, Canonicalizer, NameGenerator, OpBuilder, RewriteHandler, RewriteRegistry,
    INPUTS_SLOT, OUTPUTS_SLOT,
};
pub use compiler::{CompileStats, CompiledProgram, Compiler, FeedPolicy};
pub use dtype::{canonical_dtype, framework_dtype, DataType, VarType};
pub use error::{CompilerError, Result};
pub use graph::{Graph, Node, NodeId, OpDesc, VarDesc};
pub use program::{ConstData, ProgramBuilder, ProgramRecorder, TargetProgram, TensorId, TensorInfo};
pub use registry::HandlerRegistry;
pub use symbols::SymbolTable;
pub use tensor::{HostTensor, Place, Scope, WeightStore};
pub use vocab::{CanonicalOp, LoweringOp, LoweringRegistry, SymbolHandler};
