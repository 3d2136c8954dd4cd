use std::io;
use std::time::Duration;

/// Errors from sandbox operations.
///
/// `Unsupported` is raised by the runtime before any provider call when the
/// bound adapter does not implement an optional operation. Every other
/// variant comes from the adapter itself and is passed through unchanged.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("unsupported operation: {operation} is not implemented by adapter {adapter}")]
    Unsupported {
        adapter: &'static str,
        operation: &'static str,
    },

    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("invalid state: sandbox {id} is {state}")]
    InvalidState { id: String, state: String },

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    /// True for capability gaps, false for anything the provider reported.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, SandboxError::Unsupported { .. })
    }
}
