//! Error taxonomy for the orchestration layer.
//!
//! Every public operation resolves with a value or exactly one of these
//! variants. Nothing is retried automatically.

use std::any::Any;

use thiserror::Error;

use crate::engine::EngineError;
use crate::ids::{ContextId, RequestId};
use crate::scheduler::WorkerPoolError;

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("Context not found: {0}")]
    NotFound(ContextId),

    #[error("Context already exists: {0}")]
    AlreadyExists(ContextId),

    #[error("Context limit reached: {limit}")]
    LimitReached { limit: i64 },

    #[error("Context is busy: {0}")]
    Busy(ContextId),

    #[error("Engine initialization failed: {0}")]
    EngineInitFailed(String),

    #[error("Engine operation failed: {0}")]
    EngineOperationFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request {request_id} on context {context_id} was cancelled")]
    Cancelled {
        context_id: ContextId,
        request_id: RequestId,
    },

    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Returns true if this error is a caller-side conflict logged as a warning.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::Busy(_) | Self::LimitReached { .. } | Self::AlreadyExists(_) | Self::Cancelled { .. }
        )
    }

    /// Short stable label, used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::LimitReached { .. } => "limit_reached",
            Self::Busy(_) => "busy",
            Self::EngineInitFailed(_) => "engine_init_failed",
            Self::EngineOperationFailed(_) => "engine_operation_failed",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::ShuttingDown => "shutting_down",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// A panic caught around an engine call.
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned());
        match detail {
            Some(detail) => Self::EngineOperationFailed(format!("engine panicked: {detail}")),
            None => Self::EngineOperationFailed("engine panicked".into()),
        }
    }
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        Self::EngineOperationFailed(err.to_string())
    }
}

impl From<WorkerPoolError> for OrchestratorError {
    fn from(err: WorkerPoolError) -> Self {
        match err {
            WorkerPoolError::PoolShutdown => Self::ShuttingDown,
            other => Self::EngineOperationFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_are_warnings() {
        assert!(OrchestratorError::Busy(ContextId(1)).is_warning());
        assert!(OrchestratorError::LimitReached { limit: 1 }.is_warning());
        assert!(!OrchestratorError::EngineOperationFailed("boom".into()).is_warning());
        assert!(!OrchestratorError::NotFound(ContextId(1)).is_warning());
    }

    #[test]
    fn test_engine_error_maps_to_operation_failure() {
        let err: OrchestratorError = EngineError::Operation("decode failed".into()).into();
        assert_eq!(err, OrchestratorError::EngineOperationFailed("decode failed".into()));
        assert_eq!(err.kind(), "engine_operation_failed");
    }

    #[test]
    fn test_panic_payload_is_kept() {
        let err = OrchestratorError::from_panic(Box::new("bad tensor"));
        assert_eq!(
            err,
            OrchestratorError::EngineOperationFailed("engine panicked: bad tensor".into())
        );
    }

    #[test]
    fn test_closed_pool_means_shutting_down() {
        let err: OrchestratorError = WorkerPoolError::PoolShutdown.into();
        assert_eq!(err, OrchestratorError::ShuttingDown);
    }

    #[test]
    fn test_display_includes_ids() {
        let err = OrchestratorError::Cancelled {
            context_id: ContextId(2),
            request_id: RequestId(9),
        };
        assert_eq!(err.to_string(), "Request 9 on context 2 was cancelled");
    }
}
