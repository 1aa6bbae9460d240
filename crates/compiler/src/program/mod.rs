// Target program construction
//
// `builder` is the interface the compiler lowers against; `recorder` is the
// in-process implementation used by the runtime simulator and the tests.

pub mod builder;
pub mod recorder;
pub mod shape;

pub use builder::{ConstData, ProgramBuilder, TensorId, TensorInfo};
pub use recorder::{ProgramInitializer, ProgramOp, ProgramRecorder, TargetProgram};
