//! Error types for graph canonicalization and lowering

use std::io;
use thiserror::Error;

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompilerError>;

/// Errors that can occur while canonicalizing or lowering a graph
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Missing required attribute: {0}")]
    MissingAttribute(String),

    #[error("Invalid attribute value: {0}")]
    InvalidAttribute(String),

    #[error("Graph contains a cycle through node {0}")]
    CyclicGraph(String),

    #[error("Rewrite of `{op_type}` failed: {reason}")]
    RewriteFailed { op_type: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Graph error: {0}")]
    Graph(String),
}

impl CompilerError {
    /// Shorthand for a [`CompilerError::NotFound`] naming `what`
    pub fn not_found(what: impl Into<String>) -> Self {
        CompilerError::NotFound(what.into())
    }

    /// Shorthand for a [`CompilerError::InvalidArgument`]
    pub fn invalid(what: impl Into<String>) -> Self {
        CompilerError::InvalidArgument(what.into())
    }
}

// Graph surgery reports through anyhow; keep the message at the crate boundary
impl From<anyhow::Error> for CompilerError {
    fn from(err: anyhow::Error) -> Self {
        CompilerError::Graph(format!("{:#}", err))
    }
}
