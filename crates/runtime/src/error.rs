//! Error types for sessions, devices and the backend

use crate::config::ConfigError;
use graft_compiler::CompilerError;
use std::io;
use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while preparing or running a session
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Compiler(#[from] CompilerError),

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

    #[error("Device error: {0}")]
    Device(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
