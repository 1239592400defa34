//! Typed, defaulted option sets accepted at the orchestrator boundary.
//!
//! Each struct is validated once, before any work is scheduled. Unknown keys
//! are rejected when deserializing so misspelled options surface as
//! `InvalidArgument` instead of being silently ignored.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::ids::ContextId;

const FILE_SCHEME: &str = "file://";

/// A LoRA adapter applied at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoraAdapter {
    pub path: String,
    #[serde(default = "default_lora_scale")]
    pub scale: f32,
}

fn default_lora_scale() -> f32 {
    1.0
}

impl LoraAdapter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            scale: default_lora_scale(),
        }
    }

    pub fn validated(mut self) -> Result<Self> {
        self.path = file_path(&self.path, "lora adapter path")?;
        Ok(self)
    }
}

/// Strip a leading `file://` and reject an empty path.
pub fn file_path(path: &str, what: &str) -> Result<String> {
    let path = path.strip_prefix(FILE_SCHEME).unwrap_or(path);
    if path.trim().is_empty() {
        return Err(OrchestratorError::invalid(format!("{what} is required")));
    }
    Ok(path.to_string())
}

/// Options for creating a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextParams {
    /// Model path. Required. A leading `file://` is stripped.
    pub model: String,
    /// Requested context id. `None` lets the registry assign one.
    pub context_id: Option<ContextId>,
    pub embedding: bool,
    pub n_ctx: u32,
    pub n_batch: u32,
    /// Engine threads (0 = engine default).
    pub n_threads: u32,
    pub n_gpu_layers: u32,
    pub use_mlock: bool,
    pub use_mmap: bool,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub lora: Vec<LoraAdapter>,
    /// Parallel slots enabled right after load (0 = parallel mode off).
    pub n_parallel: u32,
    /// Emit `load_progress` events while the model loads.
    pub use_progress_callback: bool,
    /// Minimum percent step between two progress events (0 = orchestrator default).
    pub progress_every: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            model: String::new(),
            context_id: None,
            embedding: false,
            n_ctx: 512,
            n_batch: 512,
            n_threads: 0,
            n_gpu_layers: 0,
            use_mlock: false,
            use_mmap: true,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            lora: Vec::new(),
            n_parallel: 0,
            use_progress_callback: false,
            progress_every: 0,
        }
    }
}

impl ContextParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Validate and normalize. Returns the value the engine should see.
    pub fn validated(mut self) -> Result<Self> {
        if let Some(stripped) = self.model.strip_prefix(FILE_SCHEME) {
            self.model = stripped.to_string();
        }
        if self.model.trim().is_empty() {
            return Err(OrchestratorError::invalid("model path is required"));
        }
        if self.n_ctx == 0 {
            return Err(OrchestratorError::invalid("n_ctx must be > 0"));
        }
        if self.n_batch == 0 {
            return Err(OrchestratorError::invalid("n_batch must be > 0"));
        }
        if self.progress_every > 100 {
            return Err(OrchestratorError::invalid("progress_every must be <= 100"));
        }
        if self.lora.iter().any(|l| l.path.trim().is_empty()) {
            return Err(OrchestratorError::invalid("lora adapter path is required"));
        }
        Ok(self)
    }
}

/// Options for a text completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionParams {
    pub prompt: String,
    /// Tokens to predict (-1 = until EOS or context full).
    pub n_predict: i32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub penalty_repeat: f32,
    pub penalty_last_n: i32,
    pub stop: Vec<String>,
    pub grammar: Option<String>,
    pub n_probs: u32,
    pub ignore_eos: bool,
    /// Forward partial tokens as `token` events.
    pub emit_partial_completion: bool,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            n_predict: -1,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            penalty_repeat: 1.1,
            penalty_last_n: 64,
            stop: Vec::new(),
            grammar: None,
            n_probs: 0,
            ignore_eos: false,
            emit_partial_completion: true,
        }
    }
}

impl CompletionParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompt.is_empty() {
            return Err(OrchestratorError::invalid("prompt is required"));
        }
        if self.n_predict < -1 {
            return Err(OrchestratorError::invalid("n_predict must be >= -1"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(OrchestratorError::invalid("temperature must be between 0.0 and 2.0"));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(OrchestratorError::invalid("top_p must be in range (0.0, 1.0]"));
        }
        if self.penalty_last_n < -1 {
            return Err(OrchestratorError::invalid("penalty_last_n must be >= -1"));
        }
        Ok(())
    }
}

/// Options for an embedding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingParams {
    pub content: String,
    /// Normalization mode (-1 none, 0 max-abs, 1 taxicab, 2 euclidean, >2 p-norm).
    pub embd_normalize: i32,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            content: String::new(),
            embd_normalize: 2,
        }
    }
}

impl EmbeddingParams {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.content.is_empty() {
            return Err(OrchestratorError::invalid("content is required"));
        }
        if self.embd_normalize < -1 {
            return Err(OrchestratorError::invalid("embd_normalize must be >= -1"));
        }
        Ok(())
    }
}

/// Options for a rerank request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RerankParams {
    pub query: String,
    pub documents: Vec<String>,
    pub normalize: bool,
}

impl RerankParams {
    pub fn new(query: impl Into<String>, documents: Vec<String>) -> Self {
        Self {
            query: query.into(),
            documents,
            normalize: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.is_empty() {
            return Err(OrchestratorError::invalid("query is required"));
        }
        if self.documents.is_empty() {
            return Err(OrchestratorError::invalid("documents must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_scheme_is_stripped() {
        let params = ContextParams::new("file:///models/tiny.gguf").validated().unwrap();
        assert_eq!(params.model, "/models/tiny.gguf");
    }

    #[test]
    fn test_lora_path_normalized() {
        let adapter = LoraAdapter::new("file:///loras/a.bin").validated().unwrap();
        assert_eq!(adapter.path, "/loras/a.bin");
        assert_eq!(adapter.scale, 1.0);
        assert!(LoraAdapter::new(" ").validated().is_err());
    }

    #[test]
    fn test_model_path_required() {
        let err = ContextParams::new("file://").validated().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[test]
    fn test_prompt_required() {
        let err = CompletionParams::default().validate().unwrap_err();
        assert_eq!(err, OrchestratorError::InvalidArgument("prompt is required".into()));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let parsed: std::result::Result<CompletionParams, _> =
            serde_json::from_str(r#"{"prompt":"hi","temprature":0.1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_defaults_fill_missing_options() {
        let parsed: CompletionParams = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(parsed.n_predict, -1);
        assert_eq!(parsed.top_k, 40);
        assert!(parsed.emit_partial_completion);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_rerank_requires_documents() {
        assert!(RerankParams::new("q", vec![]).validate().is_err());
        assert!(RerankParams::new("q", vec!["d".into()]).validate().is_ok());
    }
}
