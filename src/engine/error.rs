//! Errors reported by the native engine collaborator.

use thiserror::Error;

/// Failures raised by an [`Engine`](super::Engine) or its handles.
///
/// The dispatch layer converts these into `EngineInitFailed` or
/// `EngineOperationFailed` depending on where they occur.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Model load interrupted")]
    LoadInterrupted,

    #[error("{0}")]
    Operation(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Slot request rejected: {0}")]
    Rejected(String),
}

impl EngineError {
    /// Returns true if the engine stopped because it was asked to.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::LoadInterrupted)
    }
}
