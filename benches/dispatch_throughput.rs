//! Dispatch throughput benchmarks.
//!
//! Measures round trips through admission, the worker pool and the
//! correlator against the scripted engine, so engine time is near zero.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gg_ctx::engine::{CompletionParams, ContextParams, EmbeddingParams, Script, ScriptedEngine};
use gg_ctx::{ContextId, NullSink, Orchestrator, OrchestratorConfig};

fn setup(contexts: usize, n_parallel: u32) -> (tokio::runtime::Runtime, Orchestrator, Vec<ContextId>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");
    let config = OrchestratorConfig {
        worker_threads: 4,
        worker_queue: 1024,
        ..Default::default()
    };
    let engine = Arc::new(ScriptedEngine::new(Script::default().with_tokens(["a", "b"])));
    let orchestrator =
        Orchestrator::new(config, engine, Arc::new(NullSink)).expect("orchestrator");

    let ids = runtime.block_on(async {
        let mut ids = Vec::with_capacity(contexts);
        for _ in 0..contexts {
            let params = ContextParams {
                n_parallel,
                ..ContextParams::new("bench.gguf")
            };
            ids.push(orchestrator.create_context(params).await.expect("context").context_id);
        }
        ids
    });
    (runtime, orchestrator, ids)
}

fn bench_single_flight(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_flight");
    group.throughput(Throughput::Elements(1));

    let (runtime, orchestrator, ids) = setup(1, 0);
    let ctx = ids[0];

    group.bench_function("complete", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(
                    orchestrator
                        .complete(ctx, CompletionParams::new("bench"))
                        .await
                        .expect("completion"),
                )
            })
        })
    });

    group.bench_function("embed", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(
                    orchestrator
                        .embed(ctx, EmbeddingParams::new("bench"))
                        .await
                        .expect("embedding"),
                )
            })
        })
    });

    group.bench_function("tokenize", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(orchestrator.tokenize(ctx, "one two three").await.expect("tokens"))
            })
        })
    });

    group.finish();
}

fn bench_across_contexts(c: &mut Criterion) {
    let mut group = c.benchmark_group("across_contexts");

    for contexts in [1usize, 4, 8] {
        let (runtime, orchestrator, ids) = setup(contexts, 0);
        group.throughput(Throughput::Elements(contexts as u64));
        group.bench_with_input(BenchmarkId::new("complete", contexts), &ids, |b, ids| {
            b.iter(|| {
                runtime.block_on(async {
                    let calls = ids
                        .iter()
                        .map(|&ctx| orchestrator.complete(ctx, CompletionParams::new("bench")));
                    for result in futures::future::join_all(calls).await {
                        black_box(result.expect("completion"));
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_queued(c: &mut Criterion) {
    let mut group = c.benchmark_group("queued");

    for batch in [1usize, 8] {
        let (runtime, orchestrator, ids) = setup(1, 8);
        let ctx = ids[0];
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(BenchmarkId::new("queue_completion", batch), |b| {
            b.iter(|| {
                runtime.block_on(async {
                    let handles: Vec<_> = (0..batch)
                        .map(|_| {
                            orchestrator
                                .queue_completion(ctx, CompletionParams::new("bench"))
                                .expect("queued")
                        })
                        .collect();
                    for handle in handles {
                        black_box(handle.result().await.expect("result"));
                    }
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_flight, bench_across_contexts, bench_queued);
criterion_main!(benches);
