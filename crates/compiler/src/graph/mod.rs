// Graph module
//
// The framework graph handed to the compiler. Canonicalization edits it in
// place; the compiler only reads it.

pub mod ir;

// Re-exports for convenience
pub use ir::{Graph, NewOp, NewVar, Node, NodeId, OpDesc, VarDesc};
