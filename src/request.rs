//! Request kinds, payloads and outcomes.

use serde::{Deserialize, Serialize};

use crate::engine::{
    CompletionOutput, CompletionParams, EmbeddingOutput, EmbeddingParams, RerankParams,
    RerankResult,
};
use crate::error::{OrchestratorError, Result};
use crate::events::EventName;
use crate::ids::{ContextId, RequestId};
use crate::scheduler::Operation;

/// What a request asks the engine to do.
///
/// Queued kinds are multiplexed by the engine's own slot scheduler and
/// correlated purely by request id; the other kinds are single-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Completion,
    QueuedCompletion,
    Embedding,
    QueuedEmbedding,
    Rerank,
    QueuedRerank,
}

impl RequestKind {
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            Self::QueuedCompletion | Self::QueuedEmbedding | Self::QueuedRerank
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::QueuedCompletion => "queued_completion",
            Self::Embedding => "embedding",
            Self::QueuedEmbedding => "queued_embedding",
            Self::Rerank => "rerank",
            Self::QueuedRerank => "queued_rerank",
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Completion => Operation::Completion,
            Self::QueuedCompletion => Operation::QueuedCompletion,
            Self::Embedding => Operation::Embedding,
            Self::QueuedEmbedding => Operation::QueuedEmbedding,
            Self::Rerank => Operation::Rerank,
            Self::QueuedRerank => Operation::QueuedRerank,
        }
    }

    /// Event carrying the final result. Only queued kinds emit one.
    pub fn result_event(&self) -> Option<EventName> {
        match self {
            Self::QueuedCompletion => Some(EventName::Completion),
            Self::QueuedEmbedding => Some(EventName::EmbeddingResult),
            Self::QueuedRerank => Some(EventName::RerankResults),
            _ => None,
        }
    }
}

/// Request lifecycle. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Typed request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Completion(CompletionParams),
    Embedding(EmbeddingParams),
    Rerank(RerankParams),
}

impl RequestPayload {
    /// Check the payload matches `kind` and passes its own validation.
    pub fn validate_for(&self, kind: RequestKind) -> Result<()> {
        match (kind, self) {
            (RequestKind::Completion | RequestKind::QueuedCompletion, Self::Completion(p)) => {
                p.validate()
            }
            (RequestKind::Embedding | RequestKind::QueuedEmbedding, Self::Embedding(p)) => {
                p.validate()
            }
            (RequestKind::Rerank | RequestKind::QueuedRerank, Self::Rerank(p)) => p.validate(),
            _ => Err(OrchestratorError::invalid(format!(
                "payload does not match request kind {}",
                kind.as_str()
            ))),
        }
    }

    /// Whether partial results should be forwarded as events.
    pub fn emits_partials(&self) -> bool {
        match self {
            Self::Completion(p) => p.emit_partial_completion,
            _ => false,
        }
    }
}

/// Successful request output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestOutput {
    Completion(CompletionOutput),
    Embedding(EmbeddingOutput),
    Rerank(Vec<RerankResult>),
}

/// Final value delivered to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub context_id: ContextId,
    /// Present for queued kinds only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub output: RequestOutput,
}

impl RequestResponse {
    pub fn into_completion(self) -> Result<CompletionOutput> {
        match self.output {
            RequestOutput::Completion(out) => Ok(out),
            _ => Err(OrchestratorError::EngineOperationFailed(
                "engine returned a non-completion result".into(),
            )),
        }
    }

    pub fn into_embedding(self) -> Result<EmbeddingOutput> {
        match self.output {
            RequestOutput::Embedding(out) => Ok(out),
            _ => Err(OrchestratorError::EngineOperationFailed(
                "engine returned a non-embedding result".into(),
            )),
        }
    }

    pub fn into_rerank(self) -> Result<Vec<RerankResult>> {
        match self.output {
            RequestOutput::Rerank(out) => Ok(out),
            _ => Err(OrchestratorError::EngineOperationFailed(
                "engine returned a non-rerank result".into(),
            )),
        }
    }
}

/// What a request resolves with.
pub type RequestResult = Result<RequestResponse>;
