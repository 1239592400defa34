// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! `demo` subcommand: drive the orchestrator against the scripted engine.
//!
//! Loads one context with progress reporting, runs a completion, a
//! tokenize call and (optionally) queued completions in parallel mode,
//! then shuts down and prints every event the sink received.

use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::engine::{CompletionParams, ContextParams, Script, ScriptedEngine};
use crate::events::{ChannelSink, Event};
use crate::orchestrator::Orchestrator;
use crate::shutdown::ShutdownResult;

/// Options for [`run_demo`].
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub prompt: String,
    /// Number of queued completions to run in parallel mode (0 = skip).
    pub parallel: u32,
    pub json: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            prompt: "Tell me a story".to_string(),
            parallel: 0,
            json: false,
        }
    }
}

impl DemoOptions {
    /// Parse `--prompt TEXT`, `--parallel N` and `--json`.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--prompt" => {
                    options.prompt = iter.next().ok_or("--prompt requires a value")?.clone();
                }
                "--parallel" => {
                    let value = iter.next().ok_or("--parallel requires a value")?;
                    options.parallel = value
                        .parse()
                        .map_err(|_| format!("invalid --parallel value: {}", value))?;
                }
                "--json" => options.json = true,
                other => return Err(format!("unknown option: {}", other)),
            }
        }
        Ok(options)
    }
}

/// Run the demo. Returns the process exit code.
pub async fn run_demo(config: OrchestratorConfig, options: DemoOptions) -> i32 {
    let script = Script::default()
        .with_tokens(options.prompt.split_inclusive(' '))
        .with_token_delay(Duration::from_millis(5))
        .with_load(10, Duration::from_millis(5));
    let engine = Arc::new(ScriptedEngine::new(script));
    let (sink, mut events) = ChannelSink::new();
    let grace = config.shutdown_grace();

    let orchestrator = match Orchestrator::new(config, engine, Arc::new(sink)) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Failed to start orchestrator: {}", e);
            return 1;
        }
    };

    let outcome = drive(&orchestrator, &options).await;
    let shutdown = orchestrator.shutdown(grace).await;

    for event in events.drain() {
        print_event(&event, options.json);
    }

    if let Err(e) = outcome {
        eprintln!("Demo failed: {}", e);
        return 1;
    }
    if let ShutdownResult::Timeout { remaining } = shutdown {
        eprintln!("Shutdown timed out with {} unit(s) remaining", remaining);
        return 1;
    }
    0
}

async fn drive(orchestrator: &Orchestrator, options: &DemoOptions) -> crate::Result<()> {
    orchestrator.toggle_native_log(true);

    let params = ContextParams {
        use_progress_callback: true,
        ..ContextParams::new("demo.gguf")
    };
    let info = orchestrator.create_context(params).await?;
    let context_id = info.context_id;
    eprintln!("context {} ready ({})", context_id, info.capabilities.model.desc);

    let output = orchestrator
        .complete(context_id, CompletionParams::new(options.prompt.clone()))
        .await?;
    eprintln!("completion: {:?} ({} tokens)", output.text, output.tokens_predicted);

    let tokens = orchestrator.tokenize(context_id, options.prompt.clone()).await?;
    eprintln!("tokenize: {} token(s)", tokens.len());
    let text = orchestrator.detokenize(context_id, tokens).await?;
    eprintln!("detokenize: {text:?}");

    if options.parallel > 0 {
        orchestrator
            .enable_parallel_mode(context_id, options.parallel, 512)
            .await?;
        let mut handles = Vec::new();
        for n in 0..options.parallel {
            let prompt = format!("{} #{}", options.prompt, n + 1);
            handles.push(orchestrator.queue_completion(context_id, CompletionParams::new(prompt))?);
        }
        for handle in handles {
            let request_id = handle.request_id();
            handle.result().await?;
            eprintln!("queued request {} finished", request_id);
        }
    }

    if let Ok(status) = serde_json::to_string_pretty(&orchestrator.status()) {
        eprintln!("{}", status);
    }
    orchestrator.release_context(context_id).await
}

fn print_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("unserializable event: {}", e),
        }
    } else {
        println!("{:<16} {}", event.name.as_str(), event.payload);
    }
}
