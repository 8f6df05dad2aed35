//! End-to-end tests for checkpointing scripted computations
//!
//! These tests cover:
//! - Suspending and resuming through each store
//! - Stubs written for components and nested functions
//! - Fingerprint checks after a script is edited and reloaded
//! - Session store retention and scope isolation
//! - Scripts served from files on disk
//! - Compressed and signed checkpoints, including tampered ones

use flowstate::testing::{ScriptedEngine, Suspended, HOST_CLASS};
use flowstate::{
    inspect, CheckpointCodec, CheckpointError, CheckpointRecord, CheckpointStore, Checkpointer,
    ComponentStub, Compression, DurableStore, Engine, FingerprintVerifier, FunctionIndex,
    FunctionStub, Integrity, Pipeline, Pooled, ReferenceRegistry, Scope, ScriptRepository,
    SessionStore, Step, Stub, TokenStore, Value,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const FLOW: &str = "\
use cache
ask name?
fn confirm {
  ask sure?
}
call 0
ask done?
";

struct Fixture {
    engine: Arc<ScriptedEngine>,
    index: Arc<FunctionIndex>,
    codec: Arc<CheckpointCodec<ScriptedEngine>>,
}

fn fixture() -> Fixture {
    let engine = Arc::new(ScriptedEngine::new());
    engine.define_component("cache");
    engine.set_source("flow.s", FLOW);
    let index = Arc::new(FunctionIndex::with_source(engine.clone()));
    let codec = CheckpointCodec::new(
        engine.clone(),
        Arc::new(ReferenceRegistry::new(engine.clone())),
        index.clone(),
        FingerprintVerifier::default(),
    )
    .exclude(HOST_CLASS);
    Fixture {
        engine,
        index,
        codec: Arc::new(codec),
    }
}

impl Fixture {
    /// Start flow.s and answer the first prompt, stopping inside `confirm`
    fn at_confirm(&self) -> Suspended {
        self.index.script("flow.s").unwrap();
        let step = self.engine.start("flow.s").unwrap();
        assert_eq!(step.output(), &Value::from("name?"));
        let step = self
            .engine
            .resume(step.into_suspended().unwrap(), Value::from("ada"))
            .unwrap();
        assert_eq!(step.output(), &Value::from("sure?"));
        step.into_suspended().unwrap()
    }

    fn next(&self, computation: Suspended, input: &str) -> Step<Suspended> {
        self.engine.resume(computation, Value::from(input)).unwrap()
    }
}

#[test]
fn test_round_trip_resumes_identically() {
    let fx = fixture();
    let computation = fx.at_confirm();
    let bytes = fx.codec.serialize(&computation, None, None).unwrap();
    let restored = fx.codec.deserialize(&bytes, None, None).unwrap();
    assert_eq!(restored, computation);

    let expected = fx.next(computation, "yes");
    let actual = fx.next(restored, "yes");
    assert_eq!(actual.output(), expected.output());
    assert_eq!(actual.output(), &Value::from("done?"));
}

#[test]
fn test_checkpoint_references_stubs() {
    let fx = fixture();
    let computation = fx.at_confirm();
    let bytes = fx.codec.serialize(&computation, None, None).unwrap();

    let summary = inspect(&bytes).unwrap();
    assert_eq!(summary.version, 1);
    assert_eq!(summary.fingerprints.len(), 2);
    assert!(summary
        .stubs
        .contains(&Stub::Component(ComponentStub::new("cache"))));
    assert!(summary
        .stubs
        .contains(&Stub::Function(FunctionStub::new("flow.s", "0."))));
    assert!(summary
        .stubs
        .contains(&Stub::Function(FunctionStub::new("flow.s", ""))));
    assert_eq!(summary.excluded, vec![HOST_CLASS.to_string()]);
    assert_eq!(summary.size, bytes.len());
}

#[test]
fn test_edited_script_fails_fingerprint_check() {
    let fx = fixture();
    let computation = fx.at_confirm();
    let bytes = fx.codec.serialize(&computation, None, None).unwrap();

    fx.engine
        .set_source("flow.s", &FLOW.replace("ask sure?", "ask really sure?"));
    fx.index.script("flow.s").unwrap();

    let err = fx.codec.deserialize(&bytes, None, None).unwrap_err();
    match err {
        CheckpointError::FingerprintMismatch { function, .. } => assert_eq!(function, "confirm"),
        other => panic!("expected fingerprint mismatch, got {:?}", other),
    }
}

#[test]
fn test_reloaded_identical_script_resumes() {
    let fx = fixture();
    let computation = fx.at_confirm();
    let bytes = fx.codec.serialize(&computation, None, None).unwrap();

    // Same text, fresh handles and code ids.
    fx.engine.set_source("flow.s", FLOW);
    fx.index.script("flow.s").unwrap();

    let restored = fx.codec.deserialize(&bytes, None, None).unwrap();
    assert_ne!(restored.function_handles(), computation.function_handles());
    assert_eq!(fx.next(restored, "yes").output(), &Value::from("done?"));
}

#[test]
fn test_replaced_component_resolves_by_name() {
    let fx = fixture();
    let computation = fx.at_confirm();
    let bytes = fx.codec.serialize(&computation, None, None).unwrap();

    let replacement = fx.engine.define_component("cache");
    let restored = fx.codec.deserialize(&bytes, None, None).unwrap();
    assert_eq!(restored.components(), &[replacement]);

    fx.engine.remove_component("cache");
    let err = fx.codec.deserialize(&bytes, None, None).unwrap_err();
    assert!(matches!(err, CheckpointError::UnresolvedStub { .. }));
}

#[tokio::test]
async fn test_session_checkpoint_reattaches_after_reload() {
    let fx = fixture();
    let checkpointer = Checkpointer::new(fx.codec.clone(), Arc::new(SessionStore::default()));
    let scope = Scope::new("session-1");
    let computation = fx.at_confirm();
    let key = checkpointer.suspend(&scope, &computation).await.unwrap();

    fx.engine
        .set_source("flow.s", &FLOW.replace("ask done?", "ask finished?"));
    fx.index.script("flow.s").unwrap();

    // The stubs captured with the session record point at the functions the
    // computation was running, so it resumes in the code it started with.
    let restored = checkpointer.resume(&scope, &key).await.unwrap().unwrap();
    assert_eq!(restored.function_handles(), computation.function_handles());
    assert_eq!(fx.next(restored, "yes").output(), &Value::from("done?"));
}

#[tokio::test]
async fn test_every_store_round_trips() {
    let fx = fixture();
    let pipeline = || {
        Pipeline::new()
            .with(Compression::default())
            .with(Integrity::new(b"integration key").unwrap())
    };
    let durable = DurableStore::connect("sqlite::memory:", 1)
        .await
        .unwrap()
        .with_pipeline(pipeline());
    durable.ensure_schema().await.unwrap();
    let stores: Vec<Arc<dyn CheckpointStore>> = vec![
        Arc::new(SessionStore::default().with_pipeline(pipeline())),
        Arc::new(durable),
        Arc::new(TokenStore::new().with_pipeline(pipeline())),
    ];

    let scope = Scope::new("user-7");
    for store in stores {
        let checkpointer = Checkpointer::new(fx.codec.clone(), store.clone());
        let computation = fx.at_confirm();
        let key = checkpointer.suspend(&scope, &computation).await.unwrap();

        let restored = checkpointer.resume(&scope, &key).await.unwrap().unwrap();
        assert_eq!(
            fx.next(restored, "yes").output(),
            &Value::from("done?"),
            "store {}",
            store.name()
        );
        assert!(
            checkpointer
                .resume(&Scope::new("user-8"), &key)
                .await
                .unwrap()
                .is_none(),
            "store {} leaked across scopes",
            store.name()
        );
    }
}

#[tokio::test]
async fn test_compressible_checkpoint_through_every_store() {
    let fx = fixture();
    let signed = || {
        Pipeline::new()
            .with(Pooled::new(Compression::default()))
            .with(Pooled::new(Integrity::new(b"integration key").unwrap()))
    };
    let durable = DurableStore::connect("sqlite::memory:", 1)
        .await
        .unwrap()
        .with_pipeline(signed());
    durable.ensure_schema().await.unwrap();
    let stores: Vec<Arc<dyn CheckpointStore>> = vec![
        Arc::new(SessionStore::default().with_pipeline(signed())),
        Arc::new(durable),
        Arc::new(TokenStore::new().with_pipeline(signed())),
    ];

    // A long repetitive answer makes the checkpoint compress far better than 2:1.
    let long_name = "ada lovelace ".repeat(2_000);
    fx.index.script("flow.s").unwrap();
    let step = fx.engine.start("flow.s").unwrap();
    let computation = fx
        .next(step.into_suspended().unwrap(), &long_name)
        .into_suspended()
        .unwrap();
    let plain = fx.codec.serialize(&computation, None, None).unwrap();
    assert!(signed().encode(plain.clone()).unwrap().len() * 4 < plain.len());

    let scope = Scope::new("user-9");
    for store in stores {
        let checkpointer = Checkpointer::new(fx.codec.clone(), store.clone());
        let key = checkpointer.suspend(&scope, &computation).await.unwrap();
        let restored = checkpointer.resume(&scope, &key).await.unwrap().unwrap();
        assert_eq!(restored, computation, "store {}", store.name());

        let step = fx.next(restored, "yes");
        assert_eq!(step.output(), &Value::from("done?"), "store {}", store.name());
        let Step::Finished(answers) = fx.next(step.into_suspended().unwrap(), "bye") else {
            panic!("flow did not finish");
        };
        assert_eq!(answers.as_list().unwrap()[0], Value::from(long_name.clone()));
    }
}

#[tokio::test]
async fn test_tampered_token_is_a_storage_failure() {
    let fx = fixture();
    let store = Arc::new(TokenStore::new().with_pipeline(
        Pipeline::new()
            .with(Compression::default())
            .with(Integrity::new(b"integration key").unwrap()),
    ));
    let checkpointer = Checkpointer::new(fx.codec.clone(), store);
    let scope = Scope::new("user-3");
    let key = checkpointer.suspend(&scope, &fx.at_confirm()).await.unwrap();

    let mut forged: Vec<char> = key.chars().collect();
    let i = forged.len() / 2;
    forged[i] = if forged[i] == 'A' { 'B' } else { 'A' };
    let forged: String = forged.into_iter().collect();
    let err = checkpointer.resume(&scope, &forged).await.unwrap_err();
    assert!(err.is_storage_failure(), "{:?}", err);

    // Compressed but unsigned garbage is corrupt, not a server fault.
    let unsigned = Checkpointer::new(
        fx.codec.clone(),
        Arc::new(TokenStore::new().with_pipeline(Pipeline::new().with(Compression::default()))),
    );
    let err = unsigned.resume(&scope, "bm90IGRlZmxhdGU").await.unwrap_err();
    assert!(matches!(err, CheckpointError::CorruptCheckpoint(_)), "{:?}", err);
}

#[tokio::test]
async fn test_session_keeps_most_recently_used() {
    let store = SessionStore::new(2).unwrap();
    let scope = Scope::new("s");
    let a = store
        .put(&scope, CheckpointRecord::new(b"a".to_vec()))
        .await
        .unwrap();
    let b = store
        .put(&scope, CheckpointRecord::new(b"b".to_vec()))
        .await
        .unwrap();
    assert!(store.get(&scope, &a).await.unwrap().is_some());
    let c = store
        .put(&scope, CheckpointRecord::new(b"c".to_vec()))
        .await
        .unwrap();

    assert!(store.get(&scope, &b).await.unwrap().is_none());
    assert_eq!(store.get(&scope, &a).await.unwrap().unwrap().bytes, b"a");
    assert_eq!(store.get(&scope, &c).await.unwrap().unwrap().bytes, b"c");
    assert_eq!(store.scope_len(&scope), 2);
}

fn set_mtime(file: &Path, secs: u64) {
    let f = fs::File::options().write(true).open(file).unwrap();
    f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[test]
fn test_scripts_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("flow.s");
    fs::write(&file, FLOW).unwrap();
    set_mtime(&file, 1_000);

    let engine = Arc::new(ScriptedEngine::new());
    engine.define_component("cache");
    let repo = Arc::new(
        ScriptRepository::new(dir.path(), engine.clone()).with_stale_check(Duration::ZERO),
    );
    let index = Arc::new(FunctionIndex::with_source(repo.clone()));
    let codec = CheckpointCodec::new(
        engine.clone(),
        Arc::new(ReferenceRegistry::new(engine.clone())),
        index.clone(),
        FingerprintVerifier::default(),
    )
    .exclude(HOST_CLASS);

    let script = index.script("flow.s").unwrap().unwrap();
    let computation = engine
        .start_compiled(&script)
        .unwrap()
        .into_suspended()
        .unwrap();
    let bytes = codec.serialize(&computation, None, None).unwrap();

    // Unchanged file: the same compiled script is served again.
    let again = index.script("flow.s").unwrap().unwrap();
    assert!(Arc::ptr_eq(&script, &again));
    codec.deserialize(&bytes, None, None).unwrap();

    fs::write(&file, FLOW.replace("use cache", "ask cache?")).unwrap();
    set_mtime(&file, 2_000);
    let reloaded = index.script("flow.s").unwrap().unwrap();
    assert_ne!(reloaded.root.handle, script.root.handle);
    assert!(matches!(
        codec.deserialize(&bytes, None, None),
        Err(CheckpointError::FingerprintMismatch { .. })
    ));
}

#[test]
fn test_function_stubs_cannot_leave_script_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("flows");
    fs::create_dir(&root).unwrap();
    fs::write(dir.path().join("secret.s"), FLOW).unwrap();
    fs::write(root.join("flow.s"), FLOW).unwrap();

    let engine = Arc::new(ScriptedEngine::new());
    engine.define_component("cache");
    let repo = Arc::new(ScriptRepository::new(&root, engine));
    let index = FunctionIndex::with_source(repo.clone());

    let absolute = dir.path().join("secret.s");
    for path in ["../secret.s", absolute.to_str().unwrap()] {
        assert!(matches!(
            index.resolve(&FunctionStub::new(path, "")),
            Err(CheckpointError::UnresolvedFunction(_))
        ));
    }
    assert!(index.resolve(&FunctionStub::new("flow.s", "0.")).is_ok());
    assert_eq!(repo.len(), 1);
}
