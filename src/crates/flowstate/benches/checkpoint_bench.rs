use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowstate::testing::{ScriptedEngine, HOST_CLASS};
use flowstate::{
    CheckpointCodec, CheckpointRecord, CheckpointStore, Compression, Engine, FingerprintVerifier,
    FunctionIndex, Integrity, Pipeline, Pooled, ReferenceRegistry, Scope, SessionStore, Value,
};
use std::sync::Arc;

const FLOW: &str = "\
use cache
ask first?
fn inner {
  fn deeper {
    ask deep?
  }
  call 0
}
call 0
";

fn codec() -> (Arc<ScriptedEngine>, CheckpointCodec<ScriptedEngine>) {
    let engine = Arc::new(ScriptedEngine::new());
    engine.define_component("cache");
    engine.set_source("bench.s", FLOW);
    let index = Arc::new(FunctionIndex::with_source(engine.clone()));
    index.script("bench.s").unwrap();
    let codec = CheckpointCodec::new(
        engine.clone(),
        Arc::new(ReferenceRegistry::new(engine.clone())),
        index,
        FingerprintVerifier::default(),
    )
    .exclude(HOST_CLASS);
    (engine, codec)
}

fn codec_benchmark(c: &mut Criterion) {
    let (engine, codec) = codec();
    let step = engine.start("bench.s").unwrap();
    let computation = engine
        .resume(step.into_suspended().unwrap(), Value::from("answer"))
        .unwrap()
        .into_suspended()
        .unwrap();
    let bytes = codec.serialize(&computation, None, None).unwrap();

    c.bench_function("checkpoint serialize", |b| {
        b.iter(|| codec.serialize(black_box(&computation), None, None).unwrap());
    });

    c.bench_function("checkpoint deserialize", |b| {
        b.iter(|| codec.deserialize(black_box(&bytes), None, None).unwrap());
    });
}

fn pipeline_benchmark(c: &mut Criterion) {
    let data = vec![42u8; 16 * 1024];
    let plain = Pipeline::new()
        .with(Compression::default())
        .with(Integrity::new(b"bench key").unwrap());
    let pooled = Pipeline::new()
        .with(Pooled::new(Compression::default()))
        .with(Pooled::new(Integrity::new(b"bench key").unwrap()));

    c.bench_function("pipeline encode", |b| {
        b.iter(|| plain.encode(black_box(data.clone())).unwrap());
    });

    c.bench_function("pooled pipeline encode", |b| {
        b.iter(|| pooled.encode(black_box(data.clone())).unwrap());
    });
}

fn session_store_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = SessionStore::new(100).unwrap();
    let scope = Scope::new("bench");

    c.bench_function("session put and get", |b| {
        b.to_async(&runtime).iter(|| async {
            let key = store
                .put(&scope, CheckpointRecord::new(black_box(vec![1; 256])))
                .await
                .unwrap();
            store.get(&scope, black_box(&key)).await.unwrap();
        });
    });
}

criterion_group!(benches, codec_benchmark, pipeline_benchmark, session_store_benchmark);
criterion_main!(benches);
