//! Benchmarks for generation streaming and history replay.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

use inference_session::inference::backend::{GenerationParams, Role};
use inference_session::inference::llama_ffi::{apply_chat_template, clean_response, ChatMessage};
use inference_session::inference::replay::{replay_history, ChatTurn};
use inference_session::inference::scripted::{ScriptedLoader, ScriptedStep};
use inference_session::inference::session::InferenceSession;

fn ready_session(rt: &Runtime, script: Vec<ScriptedStep>) -> InferenceSession {
    rt.block_on(async {
        let mut session = InferenceSession::new(Arc::new(ScriptedLoader::new(script)));
        session
            .create("/models/bench.gguf", GenerationParams::default())
            .await
            .unwrap();
        session
    })
}

fn bench_stream_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("stream_pieces");

    for pieces in [16usize, 256] {
        let words: Vec<String> = (0..pieces).map(|i| format!("w{i} ")).collect();
        let refs: Vec<&str> = words.iter().map(String::as_str).collect();
        let mut session = ready_session(&rt, ScriptedStep::pieces(&refs));

        group.bench_with_input(BenchmarkId::from_parameter(pieces), &pieces, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let outcome = session.start_query("bench").await.unwrap().finish().await;
                    black_box(outcome.text.len());
                })
            })
        });
    }

    group.finish();
}

fn bench_replay_history(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let session = ready_session(&rt, vec![]);

    let turns: Vec<ChatTurn> = (0..200)
        .map(|i| {
            if i % 2 == 0 {
                ChatTurn::user(format!("question {i}"))
            } else {
                ChatTurn::assistant(format!("answer {i}"))
            }
        })
        .collect();

    c.bench_function("replay_200_turns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let n = replay_history(&session, Some("system"), black_box(&turns))
                    .await
                    .unwrap();
                black_box(n);
            })
        })
    });
}

fn bench_chat_template(c: &mut Criterion) {
    let messages: Vec<ChatMessage> = (0..50)
        .map(|i| ChatMessage {
            role: if i % 2 == 0 { Role::User } else { Role::Assistant },
            content: format!("message number {i} with some text"),
        })
        .collect();

    c.bench_function("chat_template_50_messages", |b| {
        b.iter(|| {
            let formatted = apply_chat_template(black_box(&messages), true);
            black_box(clean_response(&formatted));
        })
    });
}

criterion_group!(
    benches,
    bench_stream_throughput,
    bench_replay_history,
    bench_chat_template,
);
criterion_main!(benches);
