//! Boundary with the native inference engine.
//!
//! The engine is an external collaborator: it loads models, decodes, embeds
//! and reranks. This module only defines the contract the orchestrator
//! consumes. All handle operations are blocking and are only ever invoked
//! from worker-pool threads.

mod error;
mod params;
pub mod scripted;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

pub use error::EngineError;
pub use params::{
    file_path, CompletionParams, ContextParams, EmbeddingParams, LoraAdapter, RerankParams,
};
pub use scripted::{CallKind, EngineCall, Script, ScriptedEngine};

/// Result of a finished completion.
///
/// Engines may report failure either by returning `Err` or by filling
/// `error`; both are treated as a failed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub text: String,
    pub tokens_predicted: u32,
    pub tokens_evaluated: u32,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,
    /// Generation ended early because of a stop signal.
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single embedding vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub embedding: Vec<f32>,
}

/// Relevance score of one document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
}

/// Session state restored into a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLoad {
    pub tokens_loaded: usize,
    /// Text of the restored tokens.
    pub prompt: String,
}

/// Metadata of the loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub desc: String,
    pub size: u64,
    pub n_embd: u32,
    pub n_params: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Immutable capability snapshot captured when a handle is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub gpu: bool,
    pub reason_no_gpu: String,
    pub devices: Vec<String>,
    pub system_info: String,
    pub model: ModelMetadata,
}

/// Severity of a native log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl NativeLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Receives load progress as a fraction in `[0.0, 1.0]`.
///
/// Returning `false` asks the engine to abandon the load.
pub trait LoadProgressCallback: Send + Sync {
    fn on_progress(&self, progress: f32) -> bool;
}

/// Receives partial completion payloads. Must not block.
pub trait PartialCallback: Send + Sync {
    fn on_partial(&self, payload: serde_json::Value);
}

/// Receives the final result of a queued completion, exactly once.
pub trait CompletionCallback: Send + Sync {
    fn on_complete(&self, request_id: RequestId, result: Result<CompletionOutput, EngineError>);
}

/// Receives the final result of a queued embedding, exactly once.
pub trait EmbeddingCallback: Send + Sync {
    fn on_result(&self, request_id: RequestId, result: Result<EmbeddingOutput, EngineError>);
}

/// Receives the final result of a queued rerank, exactly once.
pub trait RerankCallback: Send + Sync {
    fn on_results(&self, request_id: RequestId, result: Result<Vec<RerankResult>, EngineError>);
}

/// Receives native log lines.
pub trait NativeLogCallback: Send + Sync {
    fn on_log(&self, level: NativeLogLevel, text: &str);
}

/// Factory for engine handles.
pub trait Engine: Send + Sync {
    /// Load a model. Blocks until loaded, failed, or interrupted through
    /// `progress` returning `false`.
    fn init(
        &self,
        params: &ContextParams,
        progress: Arc<dyn LoadProgressCallback>,
    ) -> Result<Arc<dyn EngineHandle>, EngineError>;

    /// Install or remove the process-wide native log callback.
    fn set_log_callback(&self, callback: Option<Arc<dyn NativeLogCallback>>);
}

/// One loaded model plus its decoding state.
///
/// Queued operations return as soon as the engine accepted the work and
/// report their result later through the callback, on an engine thread.
pub trait EngineHandle: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities;

    fn complete(
        &self,
        params: &CompletionParams,
        partial: &dyn PartialCallback,
    ) -> Result<CompletionOutput, EngineError>;

    fn queue_complete(
        &self,
        request_id: RequestId,
        params: &CompletionParams,
        partial: Arc<dyn PartialCallback>,
        done: Arc<dyn CompletionCallback>,
    ) -> Result<(), EngineError>;

    fn embed(&self, params: &EmbeddingParams) -> Result<EmbeddingOutput, EngineError>;

    fn queue_embed(
        &self,
        request_id: RequestId,
        params: &EmbeddingParams,
        done: Arc<dyn EmbeddingCallback>,
    ) -> Result<(), EngineError>;

    fn rerank(&self, params: &RerankParams) -> Result<Vec<RerankResult>, EngineError>;

    fn queue_rerank(
        &self,
        request_id: RequestId,
        params: &RerankParams,
        done: Arc<dyn RerankCallback>,
    ) -> Result<(), EngineError>;

    fn tokenize(&self, text: &str) -> Result<Vec<i32>, EngineError>;

    fn detokenize(&self, _tokens: &[i32]) -> Result<String, EngineError> {
        Err(EngineError::Unsupported("detokenize".into()))
    }

    /// Restore evaluated tokens from a session file.
    fn load_session(&self, _path: &str) -> Result<SessionLoad, EngineError> {
        Err(EngineError::Unsupported("load_session".into()))
    }

    /// Write up to `size` evaluated tokens (`<= 0` = all). Returns the count saved.
    fn save_session(&self, _path: &str, _size: i32) -> Result<usize, EngineError> {
        Err(EngineError::Unsupported("save_session".into()))
    }

    fn apply_lora_adapters(&self, _adapters: &[LoraAdapter]) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("lora adapters".into()))
    }

    fn remove_lora_adapters(&self) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("lora adapters".into()))
    }

    fn loaded_lora_adapters(&self) -> Result<Vec<LoraAdapter>, EngineError> {
        Ok(Vec::new())
    }

    fn enable_parallel(&self, n_parallel: u32, n_batch: u32) -> Result<(), EngineError>;

    fn disable_parallel(&self) -> Result<(), EngineError>;

    /// Ask the running non-queued completion to stop at its next checkpoint.
    fn stop(&self);

    /// Ask a load still in progress to abandon.
    fn interrupt_load(&self);

    /// Abandon one queued request. Returns false if the engine did not know it.
    fn cancel(&self, request_id: RequestId) -> bool;

    /// Free native resources. Called once, after every task has drained.
    fn release(&self);
}
