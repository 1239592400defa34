//! Scripted engine: a deterministic in-process stand-in for the native engine.
//!
//! Used by the demo command, the benches and the test suites. Every call is
//! recorded in order so callers can assert on sequencing (stop before
//! release, partials before results). A gate lets tests hold generation
//! mid-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    CompletionCallback, CompletionOutput, CompletionParams, ContextParams, EmbeddingCallback,
    EmbeddingOutput, EmbeddingParams, Engine, EngineCapabilities, EngineError, EngineHandle,
    LoadProgressCallback, LoraAdapter, ModelMetadata, NativeLogCallback, NativeLogLevel,
    PartialCallback, RerankCallback, RerankParams, RerankResult, SessionLoad,
};
use crate::ids::RequestId;

/// Behaviour knobs. Handles read the current script at the start of each call.
#[derive(Debug, Clone)]
pub struct Script {
    /// Tokens produced by every completion, in order.
    pub tokens: Vec<String>,
    /// Sleep before each token (and before queued embed/rerank results).
    pub token_delay: Duration,
    /// When false, `stop` is recorded but generation runs to the end.
    pub honor_stop: bool,
    /// Completion returns `Ok` with this value in its `error` field.
    pub error_field: Option<String>,
    /// Operations return `Err(EngineError::Operation)` with this message.
    pub fail_with: Option<String>,
    pub panic_on_complete: bool,
    pub fail_init: Option<String>,
    pub load_steps: u32,
    pub load_delay: Duration,
    pub embedding: Vec<f32>,
    /// Sleep inside `queue_*` after the call is recorded, before the slot opens.
    pub accept_delay: Duration,
    /// Sleep at the top of `complete`, before the stop flag is reset.
    pub start_delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            tokens: vec!["Hello".into(), ",".into(), " world".into()],
            token_delay: Duration::ZERO,
            honor_stop: true,
            error_field: None,
            fail_with: None,
            panic_on_complete: false,
            fail_init: None,
            load_steps: 4,
            load_delay: Duration::ZERO,
            embedding: vec![0.6, 0.8],
            accept_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
        }
    }
}

impl Script {
    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn ignoring_stop(mut self) -> Self {
        self.honor_stop = false;
        self
    }

    pub fn with_load(mut self, steps: u32, delay: Duration) -> Self {
        self.load_steps = steps;
        self.load_delay = delay;
        self
    }

    pub fn with_accept_delay(mut self, delay: Duration) -> Self {
        self.accept_delay = delay;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

/// Kind of a recorded engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Init,
    LoadInterrupted,
    CompleteStarted,
    CompleteFinished,
    QueueComplete,
    /// A `queue_*` call is about to return `Ok`.
    QueueAccepted,
    QueuedFinished,
    Embed,
    Rerank,
    Tokenize,
    Detokenize,
    LoadSession,
    SaveSession,
    ApplyLora,
    RemoveLora,
    EnableParallel,
    DisableParallel,
    Stop,
    InterruptLoad,
    Cancel,
    Release,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    /// Sequence number of the handle (init order, starting at 1).
    pub handle: u64,
    pub kind: CallKind,
    pub request_id: Option<RequestId>,
}

struct Recorder {
    calls: Mutex<Vec<EngineCall>>,
    changed: Condvar,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Recorder {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            changed: Condvar::new(),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn record(&self, handle: u64, kind: CallKind, request_id: Option<RequestId>) {
        self.calls.lock().push(EngineCall {
            handle,
            kind,
            request_id,
        });
        self.changed.notify_all();
    }

    fn enter_completion(&self, handle: u64) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.record(handle, CallKind::CompleteStarted, None);
    }

    fn leave_completion(&self, handle: u64) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.record(handle, CallKind::CompleteFinished, None);
    }
}

struct Gate {
    held: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self, stop: &AtomicBool, honor_stop: bool) {
        let mut held = self.held.lock();
        while *held {
            if honor_stop && stop.load(Ordering::SeqCst) {
                break;
            }
            self.cv.wait_for(&mut held, Duration::from_millis(5));
        }
    }
}

/// Deterministic engine with recorded calls.
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    recorder: Arc<Recorder>,
    gate: Arc<Gate>,
    log: Mutex<Option<Arc<dyn NativeLogCallback>>>,
    next_handle: AtomicU64,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            recorder: Arc::new(Recorder::new()),
            gate: Arc::new(Gate {
                held: Mutex::new(false),
                cv: Condvar::new(),
            }),
            log: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Change behaviour for calls that start from now on.
    pub fn update_script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock());
    }

    /// Block generation before the next token until [`resume`](Self::resume).
    pub fn hold(&self) {
        *self.gate.held.lock() = true;
    }

    pub fn resume(&self) {
        *self.gate.held.lock() = false;
        self.gate.cv.notify_all();
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.recorder.calls.lock().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.recorder.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    /// Index of the first call of `kind`.
    pub fn position(&self, kind: CallKind) -> Option<usize> {
        self.recorder.calls.lock().iter().position(|c| c.kind == kind)
    }

    /// Index of the last call of `kind`.
    pub fn last_position(&self, kind: CallKind) -> Option<usize> {
        self.recorder.calls.lock().iter().rposition(|c| c.kind == kind)
    }

    /// Highest number of non-queued completions observed running at once.
    pub fn max_concurrent_completions(&self) -> usize {
        self.recorder.max_running.load(Ordering::SeqCst)
    }

    /// Block until at least `count` calls of `kind` were recorded.
    pub fn wait_for(&self, kind: CallKind, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut calls = self.recorder.calls.lock();
        loop {
            if calls.iter().filter(|c| c.kind == kind).count() >= count {
                return true;
            }
            if self.recorder.changed.wait_until(&mut calls, deadline).timed_out() {
                return calls.iter().filter(|c| c.kind == kind).count() >= count;
            }
        }
    }

    /// Emit a native log line through the installed callback, if any.
    pub fn emit_log(&self, level: NativeLogLevel, text: &str) {
        let callback = self.log.lock().clone();
        if let Some(callback) = callback {
            callback.on_log(level, text);
        }
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(Script::default())
    }
}

impl Engine for ScriptedEngine {
    fn init(
        &self,
        params: &ContextParams,
        progress: Arc<dyn LoadProgressCallback>,
    ) -> Result<Arc<dyn EngineHandle>, EngineError> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(id, CallKind::Init, None);
        self.emit_log(NativeLogLevel::Info, &format!("loading model {}", params.model));

        let script = self.script.lock().clone();
        if let Some(reason) = script.fail_init {
            return Err(EngineError::LoadFailed(reason));
        }
        for step in 1..=script.load_steps {
            if !script.load_delay.is_zero() {
                thread::sleep(script.load_delay);
            }
            if !progress.on_progress(step as f32 / script.load_steps as f32) {
                self.recorder.record(id, CallKind::LoadInterrupted, None);
                return Err(EngineError::LoadInterrupted);
            }
        }

        Ok(Arc::new(ScriptedHandle {
            id,
            model: params.model.clone(),
            script: self.script.clone(),
            recorder: self.recorder.clone(),
            gate: self.gate.clone(),
            stopped: AtomicBool::new(false),
            parallel: AtomicBool::new(false),
            slots: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(Vec::new()),
            vocab: Mutex::new(Vec::new()),
            session: Mutex::new(Vec::new()),
            lora: Mutex::new(params.lora.clone()),
        }))
    }

    fn set_log_callback(&self, callback: Option<Arc<dyn NativeLogCallback>>) {
        *self.log.lock() = callback;
    }
}

type Slots = Arc<Mutex<HashMap<RequestId, Arc<AtomicBool>>>>;

struct ScriptedHandle {
    id: u64,
    model: String,
    script: Arc<Mutex<Script>>,
    recorder: Arc<Recorder>,
    gate: Arc<Gate>,
    stopped: AtomicBool,
    parallel: AtomicBool,
    slots: Slots,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Word per token id, grown by `tokenize`.
    vocab: Mutex<Vec<String>>,
    /// Tokens of the last evaluated prompt, persisted by `save_session`.
    session: Mutex<Vec<i32>>,
    lora: Mutex<Vec<LoraAdapter>>,
}

#[derive(Serialize, Deserialize)]
struct SessionFile {
    tokens: Vec<i32>,
}

fn generate(
    script: &Script,
    gate: &Gate,
    params: &CompletionParams,
    partial: &dyn PartialCallback,
    stop: &AtomicBool,
    request_id: Option<RequestId>,
) -> CompletionOutput {
    let limit = usize::try_from(params.n_predict).unwrap_or(usize::MAX);
    let mut text = String::new();
    let mut predicted = 0u32;
    let mut interrupted = false;

    for token in script.tokens.iter().take(limit) {
        gate.wait(stop, script.honor_stop);
        if script.honor_stop && stop.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }
        if !script.token_delay.is_zero() {
            thread::sleep(script.token_delay);
        }
        text.push_str(token);
        predicted += 1;
        let mut payload = json!({ "token": token });
        if let Some(request_id) = request_id {
            payload["requestId"] = json!(request_id);
        }
        partial.on_partial(payload);
    }

    CompletionOutput {
        text,
        tokens_predicted: predicted,
        tokens_evaluated: params.prompt.split_whitespace().count() as u32,
        stopped_eos: !interrupted && limit >= script.tokens.len(),
        stopped_limit: !interrupted && limit < script.tokens.len(),
        interrupted,
        error: script.error_field.clone(),
        ..Default::default()
    }
}

fn rerank_scores(params: &RerankParams) -> Vec<RerankResult> {
    let query: Vec<&str> = params.query.split_whitespace().collect();
    let mut results: Vec<RerankResult> = params
        .documents
        .iter()
        .enumerate()
        .map(|(index, doc)| RerankResult {
            index,
            score: doc.split_whitespace().filter(|w| query.contains(w)).count() as f32,
        })
        .collect();
    if params.normalize {
        let max = results.iter().map(|r| r.score).fold(0.0f32, f32::max);
        if max > 0.0 {
            results.iter_mut().for_each(|r| r.score /= max);
        }
    }
    results
}

impl ScriptedHandle {
    fn script(&self) -> Script {
        self.script.lock().clone()
    }

    fn require_parallel(&self) -> Result<(), EngineError> {
        if self.parallel.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Rejected("parallel mode not enabled".into()))
        }
    }

    /// Record the queued call and sit in the engine for `accept_delay`.
    fn begin_queue(&self, kind: CallKind, request_id: RequestId, script: &Script) {
        self.recorder.record(self.id, kind, Some(request_id));
        if !script.accept_delay.is_zero() {
            thread::sleep(script.accept_delay);
        }
    }

    fn accepted(
        &self,
        request_id: RequestId,
        spawned: Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        spawned?;
        self.recorder.record(self.id, CallKind::QueueAccepted, Some(request_id));
        Ok(())
    }

    fn to_tokens(&self, text: &str) -> Vec<i32> {
        let mut vocab = self.vocab.lock();
        text.split_whitespace()
            .map(|word| {
                let id = match vocab.iter().position(|w| w == word) {
                    Some(id) => id,
                    None => {
                        vocab.push(word.to_string());
                        vocab.len() - 1
                    }
                };
                id as i32
            })
            .collect()
    }

    fn to_text(&self, tokens: &[i32]) -> Result<String, EngineError> {
        let vocab = self.vocab.lock();
        let words = tokens
            .iter()
            .map(|&t| {
                usize::try_from(t)
                    .ok()
                    .and_then(|i| vocab.get(i))
                    .map(String::as_str)
                    .ok_or_else(|| EngineError::Operation(format!("unknown token {t}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(words.join(" "))
    }

    fn open_slot(&self, request_id: RequestId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.slots.lock().insert(request_id, flag.clone());
        flag
    }

    /// Run `job` on an engine-owned thread, like a native slot loop would.
    fn spawn_slot(&self, job: impl FnOnce() + Send + 'static) -> Result<(), EngineError> {
        let handle = thread::Builder::new()
            .name(format!("scripted-slot-{}", self.id))
            .spawn(job)
            .map_err(|e| EngineError::Operation(e.to_string()))?;
        self.workers.lock().push(handle);
        Ok(())
    }
}

impl EngineHandle for ScriptedHandle {
    fn capabilities(&self) -> EngineCapabilities {
        let script = self.script();
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("general.name".to_string(), self.model.clone());
        EngineCapabilities {
            gpu: false,
            reason_no_gpu: "scripted engine runs on the CPU only".into(),
            devices: Vec::new(),
            system_info: "scripted".into(),
            model: ModelMetadata {
                desc: format!("scripted {}", self.model),
                size: 0,
                n_embd: script.embedding.len() as u32,
                n_params: 0,
                metadata,
            },
        }
    }

    fn complete(
        &self,
        params: &CompletionParams,
        partial: &dyn PartialCallback,
    ) -> Result<CompletionOutput, EngineError> {
        let script = self.script();
        if script.panic_on_complete {
            panic!("scripted engine panic");
        }
        if !script.start_delay.is_zero() {
            thread::sleep(script.start_delay);
        }
        // Like a native engine, a new generation clears any earlier stop.
        self.stopped.store(false, Ordering::SeqCst);
        *self.session.lock() = self.to_tokens(&params.prompt);
        self.recorder.enter_completion(self.id);
        let output = generate(&script, &self.gate, params, partial, &self.stopped, None);
        self.recorder.leave_completion(self.id);
        match script.fail_with {
            Some(reason) => Err(EngineError::Operation(reason)),
            None => Ok(output),
        }
    }

    fn queue_complete(
        &self,
        request_id: RequestId,
        params: &CompletionParams,
        partial: Arc<dyn PartialCallback>,
        done: Arc<dyn CompletionCallback>,
    ) -> Result<(), EngineError> {
        self.require_parallel()?;
        let script = self.script();
        self.begin_queue(CallKind::QueueComplete, request_id, &script);
        let flag = self.open_slot(request_id);
        let (gate, recorder, slots, params, id) = (
            self.gate.clone(),
            self.recorder.clone(),
            self.slots.clone(),
            params.clone(),
            self.id,
        );
        let spawned = self.spawn_slot(move || {
            let output = generate(&script, &gate, &params, partial.as_ref(), &flag, Some(request_id));
            slots.lock().remove(&request_id);
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let result = match script.fail_with {
                Some(reason) => Err(EngineError::Operation(reason)),
                None => Ok(output),
            };
            done.on_complete(request_id, result);
            recorder.record(id, CallKind::QueuedFinished, Some(request_id));
        });
        self.accepted(request_id, spawned)
    }

    fn embed(&self, _params: &EmbeddingParams) -> Result<EmbeddingOutput, EngineError> {
        self.recorder.record(self.id, CallKind::Embed, None);
        let script = self.script();
        if !script.token_delay.is_zero() {
            thread::sleep(script.token_delay);
        }
        if let Some(reason) = script.fail_with {
            return Err(EngineError::Operation(reason));
        }
        Ok(EmbeddingOutput {
            embedding: script.embedding,
        })
    }

    fn queue_embed(
        &self,
        request_id: RequestId,
        _params: &EmbeddingParams,
        done: Arc<dyn EmbeddingCallback>,
    ) -> Result<(), EngineError> {
        self.require_parallel()?;
        let script = self.script();
        self.begin_queue(CallKind::Embed, request_id, &script);
        let flag = self.open_slot(request_id);
        let slots = self.slots.clone();
        let spawned = self.spawn_slot(move || {
            thread::sleep(script.token_delay);
            slots.lock().remove(&request_id);
            if !flag.load(Ordering::SeqCst) {
                done.on_result(
                    request_id,
                    Ok(EmbeddingOutput {
                        embedding: script.embedding,
                    }),
                );
            }
        });
        self.accepted(request_id, spawned)
    }

    fn rerank(&self, params: &RerankParams) -> Result<Vec<RerankResult>, EngineError> {
        self.recorder.record(self.id, CallKind::Rerank, None);
        let script = self.script();
        if let Some(reason) = script.fail_with {
            return Err(EngineError::Operation(reason));
        }
        Ok(rerank_scores(params))
    }

    fn queue_rerank(
        &self,
        request_id: RequestId,
        params: &RerankParams,
        done: Arc<dyn RerankCallback>,
    ) -> Result<(), EngineError> {
        self.require_parallel()?;
        let script = self.script();
        self.begin_queue(CallKind::Rerank, request_id, &script);
        let flag = self.open_slot(request_id);
        let slots = self.slots.clone();
        let params = params.clone();
        let spawned = self.spawn_slot(move || {
            thread::sleep(script.token_delay);
            slots.lock().remove(&request_id);
            if !flag.load(Ordering::SeqCst) {
                done.on_results(request_id, Ok(rerank_scores(&params)));
            }
        });
        self.accepted(request_id, spawned)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>, EngineError> {
        self.recorder.record(self.id, CallKind::Tokenize, None);
        Ok(self.to_tokens(text))
    }

    fn detokenize(&self, tokens: &[i32]) -> Result<String, EngineError> {
        self.recorder.record(self.id, CallKind::Detokenize, None);
        self.to_text(tokens)
    }

    fn load_session(&self, path: &str) -> Result<SessionLoad, EngineError> {
        self.recorder.record(self.id, CallKind::LoadSession, None);
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Operation(format!("Failed to load session: {e}")))?;
        let file: SessionFile = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Operation(format!("Failed to load session: {e}")))?;
        let prompt = self.to_text(&file.tokens)?;
        let tokens_loaded = file.tokens.len();
        *self.session.lock() = file.tokens;
        Ok(SessionLoad {
            tokens_loaded,
            prompt,
        })
    }

    fn save_session(&self, path: &str, size: i32) -> Result<usize, EngineError> {
        self.recorder.record(self.id, CallKind::SaveSession, None);
        let mut tokens = self.session.lock().clone();
        if let Ok(size) = usize::try_from(size) {
            if size > 0 && size < tokens.len() {
                tokens.truncate(size);
            }
        }
        let saved = tokens.len();
        let raw = serde_json::to_string(&SessionFile { tokens })
            .map_err(|e| EngineError::Operation(e.to_string()))?;
        std::fs::write(path, raw)
            .map_err(|e| EngineError::Operation(format!("Failed to save session: {e}")))?;
        Ok(saved)
    }

    fn apply_lora_adapters(&self, adapters: &[LoraAdapter]) -> Result<(), EngineError> {
        self.recorder.record(self.id, CallKind::ApplyLora, None);
        if let Some(reason) = self.script().fail_with {
            return Err(EngineError::Operation(reason));
        }
        let mut loaded = self.lora.lock();
        for adapter in adapters {
            match loaded.iter_mut().find(|a| a.path == adapter.path) {
                Some(existing) => existing.scale = adapter.scale,
                None => loaded.push(adapter.clone()),
            }
        }
        Ok(())
    }

    fn remove_lora_adapters(&self) -> Result<(), EngineError> {
        self.recorder.record(self.id, CallKind::RemoveLora, None);
        self.lora.lock().clear();
        Ok(())
    }

    fn loaded_lora_adapters(&self) -> Result<Vec<LoraAdapter>, EngineError> {
        Ok(self.lora.lock().clone())
    }

    fn enable_parallel(&self, n_parallel: u32, n_batch: u32) -> Result<(), EngineError> {
        self.recorder.record(self.id, CallKind::EnableParallel, None);
        if n_parallel == 0 || n_batch == 0 {
            return Err(EngineError::Rejected("n_parallel and n_batch must be > 0".into()));
        }
        self.parallel.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable_parallel(&self) -> Result<(), EngineError> {
        self.recorder.record(self.id, CallKind::DisableParallel, None);
        self.parallel.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.recorder.record(self.id, CallKind::Stop, None);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn interrupt_load(&self) {
        self.recorder.record(self.id, CallKind::InterruptLoad, None);
    }

    fn cancel(&self, request_id: RequestId) -> bool {
        self.recorder.record(self.id, CallKind::Cancel, Some(request_id));
        match self.slots.lock().get(&request_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn release(&self) {
        for flag in self.slots.lock().values() {
            flag.store(true, Ordering::SeqCst);
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        self.recorder.record(self.id, CallKind::Release, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Mutex<Vec<serde_json::Value>>);

    impl PartialCallback for Collect {
        fn on_partial(&self, payload: serde_json::Value) {
            self.0.lock().push(payload);
        }
    }

    struct AlwaysContinue;

    impl LoadProgressCallback for AlwaysContinue {
        fn on_progress(&self, _progress: f32) -> bool {
            true
        }
    }

    #[test]
    fn test_complete_emits_each_token() {
        let engine = ScriptedEngine::new(Script::default().with_tokens(["a", "b"]));
        let handle = engine.init(&ContextParams::new("m"), Arc::new(AlwaysContinue)).unwrap();
        let sink = Collect(Mutex::new(Vec::new()));
        let out = handle.complete(&CompletionParams::new("hi"), &sink).unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(sink.0.lock().len(), 2);
        assert_eq!(engine.max_concurrent_completions(), 1);
    }

    #[test]
    fn test_n_predict_limits_tokens() {
        let engine = ScriptedEngine::default();
        let handle = engine.init(&ContextParams::new("m"), Arc::new(AlwaysContinue)).unwrap();
        let params = CompletionParams {
            n_predict: 1,
            ..CompletionParams::new("hi")
        };
        let out = handle.complete(&params, &Collect(Mutex::new(Vec::new()))).unwrap();
        assert_eq!(out.tokens_predicted, 1);
        assert!(out.stopped_limit);
    }

    #[test]
    fn test_queue_requires_parallel_mode() {
        struct Ignore;
        impl CompletionCallback for Ignore {
            fn on_complete(&self, _: RequestId, _: Result<CompletionOutput, EngineError>) {}
        }
        impl PartialCallback for Ignore {
            fn on_partial(&self, _: serde_json::Value) {}
        }
        let engine = ScriptedEngine::default();
        let handle = engine.init(&ContextParams::new("m"), Arc::new(AlwaysContinue)).unwrap();
        let err = handle
            .queue_complete(RequestId(1), &CompletionParams::new("x"), Arc::new(Ignore), Arc::new(Ignore))
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }

    #[test]
    fn test_detokenize_reverses_tokenize() {
        let engine = ScriptedEngine::default();
        let handle = engine.init(&ContextParams::new("m"), Arc::new(AlwaysContinue)).unwrap();
        let tokens = handle.tokenize("the cat saw the dog").unwrap();
        assert_eq!(tokens[0], tokens[3]);
        assert_eq!(handle.detokenize(&tokens).unwrap(), "the cat saw the dog");
        assert!(handle.detokenize(&[99]).is_err());
    }

    #[test]
    fn test_session_keeps_last_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let path = path.to_str().unwrap();

        let engine = ScriptedEngine::default();
        let handle = engine.init(&ContextParams::new("m"), Arc::new(AlwaysContinue)).unwrap();
        handle
            .complete(&CompletionParams::new("a b c"), &Collect(Mutex::new(Vec::new())))
            .unwrap();
        assert_eq!(handle.save_session(path, 2).unwrap(), 2);

        let loaded = handle.load_session(path).unwrap();
        assert_eq!(loaded.tokens_loaded, 2);
        assert_eq!(loaded.prompt, "a b");
    }

    #[test]
    fn test_lora_apply_updates_scale_in_place() {
        let params = ContextParams {
            lora: vec![LoraAdapter {
                path: "base.bin".into(),
                scale: 1.0,
            }],
            ..ContextParams::new("m")
        };
        let engine = ScriptedEngine::default();
        let handle = engine.init(&params, Arc::new(AlwaysContinue)).unwrap();
        handle
            .apply_lora_adapters(&[LoraAdapter {
                path: "base.bin".into(),
                scale: 0.5,
            }])
            .unwrap();
        assert_eq!(handle.loaded_lora_adapters().unwrap()[0].scale, 0.5);
        handle.remove_lora_adapters().unwrap();
        assert!(handle.loaded_lora_adapters().unwrap().is_empty());
    }

    #[test]
    fn test_rerank_scores_by_overlap() {
        let params = RerankParams {
            normalize: true,
            ..RerankParams::new("red fox", vec!["a red fox".into(), "blue".into()])
        };
        let scores = rerank_scores(&params);
        assert_eq!(scores[0].score, 1.0);
        assert_eq!(scores[1].score, 0.0);
    }
}
