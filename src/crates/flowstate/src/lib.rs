//! # flowstate - Checkpointing for Suspended Script Computations
//!
//! **Serialize a suspended computation, store it, and resume it later** in the
//! same process, another process, or after the scripts it runs have been
//! reloaded. A computation's object graph is written with every reference to
//! shared runtime state replaced by a symbolic stub, and checked on the way
//! back in against fingerprints of the code it was running.
//!
//! ## Overview
//!
//! A checkpoint must not drag the world along with it. Long-lived components
//! (caches, services, database handles) and compiled functions are shared by
//! every computation, so the codec writes them as names rather than values:
//!
//! - **Component stubs** - `stub:cache`, resolved by name at resume time
//! - **Function stubs** - `stub:flow.s#0.1.`, a script path plus a position in
//!   its tree of nested functions
//! - **Context stubs** - `stub:context:…`, handed out by a per-request
//!   [`StubProvider`] for objects only the caller knows how to rebuild
//! - **Excluded classes** - runtime helpers re-created by the engine
//!
//! ## Core Concepts
//!
//! ### 1. Engine
//!
//! The [`Engine`] trait is the seam to the script runtime: it exposes a
//! computation's object graph, rebuilds a computation from one, walks its
//! frames and hands out the compiled bytes of each frame's code.
//! `testing::ScriptedEngine`, behind the `testing` feature, is a small
//! engine used by the tests and benchmarks.
//!
//! ### 2. Registries
//!
//! - [`ReferenceRegistry`] - named components, resolved live by name
//! - [`FunctionIndex`] - function handles to [`FunctionStub`]s, merged
//!   copy-on-write so readers never block, reloading scripts on a miss
//! - [`ScriptRepository`] - compiled scripts cached per file and recompiled
//!   when the file's modification time moves
//!
//! ### 3. Codec
//!
//! [`CheckpointCodec`] writes a versioned envelope:
//!
//! ```text
//! "FLST" | version | [fingerprints] | object graph
//! ```
//!
//! On resume the fingerprints are checked against the code each frame now
//! runs. A script edited since the checkpoint was taken fails with
//! [`CheckpointError::FingerprintMismatch`] instead of resuming into the
//! wrong instruction.
//!
//! ### 4. Stores
//!
//! | Store            | Keeps                         | Suited for                     |
//! |------------------|-------------------------------|--------------------------------|
//! | [`SessionStore`] | LRU of N states per scope     | single process, back button    |
//! | [`DurableStore`] | one SQLite row per checkpoint | restarts, multiple nodes       |
//! | [`TokenStore`]   | nothing, caller holds token   | stateless deployments          |
//!
//! ### 5. Transforms
//!
//! A [`Pipeline`] of reversible byte transforms ([`Compression`],
//! [`Integrity`]) sits between the codec and a store. [`Pooled`] reuses coder
//! instances across calls.
//!
//! ## Quick Start
//!
//! ```rust
//! use flowstate::testing::{ScriptedEngine, HOST_CLASS};
//! use flowstate::{
//!     CheckpointCodec, Checkpointer, FingerprintVerifier, FunctionIndex,
//!     ReferenceRegistry, Scope, SessionStore, Value, Engine,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> flowstate::Result<()> {
//! let engine = Arc::new(ScriptedEngine::new());
//! engine.set_source("greet.s", "ask name?\nask age?\n");
//!
//! let index = Arc::new(FunctionIndex::with_source(engine.clone()));
//! let codec = CheckpointCodec::new(
//!     engine.clone(),
//!     Arc::new(ReferenceRegistry::new(engine.clone())),
//!     index.clone(),
//!     FingerprintVerifier::default(),
//! )
//! .exclude(HOST_CLASS);
//! let checkpointer = Checkpointer::new(Arc::new(codec), Arc::new(SessionStore::default()));
//!
//! let computation = engine.start("greet.s")?.into_suspended().unwrap();
//! index.script("greet.s")?;
//!
//! let scope = Scope::new("session-1");
//! let key = checkpointer.suspend(&scope, &computation).await?;
//! let restored = checkpointer.resume(&scope, &key).await?.unwrap();
//! let step = engine.resume(restored, Value::from("Ada"))?;
//! assert_eq!(step.output(), &Value::from("age?"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`StorageSettings`] selects and builds a store from a YAML or JSON file
//! with `FLOWSTATE_*` environment overrides; see [`config`].
//!
//! ## Module Organization
//!
//! - [`value`], [`stub`], [`engine`] - object graph, stubs and the engine seam
//! - [`registry`], [`index`], [`scripts`], [`cache`] - name resolution
//! - [`fingerprint`], [`codec`] - checkpoint format and verification
//! - [`store`], [`id`], [`transform`] - persistence
//! - [`checkpointer`], [`config`] - wiring
//! - [`error`] - [`CheckpointError`]

pub mod cache;
pub mod checkpointer;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod index;
pub mod registry;
pub mod scripts;
pub mod store;
pub mod stub;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transform;
pub mod value;

// Re-export main types
pub use checkpointer::Checkpointer;
pub use codec::{
    inspect, inspect_with_limit, CheckpointCodec, CheckpointSummary, StubProvider, StubResolver,
};
pub use config::{Backend, KeyPolicy, StorageSettings};
pub use engine::{CodeId, Engine, Frame, Step};
pub use error::{CheckpointError, Result};
pub use fingerprint::{Fingerprint, FingerprintCache, FingerprintVerifier};
pub use id::{ContentIdGenerator, IdGenerator, RandomIdGenerator};
pub use index::{CompiledScript, FunctionIndex, FunctionNode, ScriptSource};
pub use registry::{ComponentSource, ReferenceRegistry};
pub use scripts::{ScriptCompiler, ScriptRepository};
pub use store::{
    CheckpointRecord, CheckpointStore, CollisionPolicy, DurableStore, Scope, SessionStore,
    TokenStore,
};
pub use stub::{ComponentStub, FunctionStub, Stub, StubTable};
pub use transform::{Compression, CompressionLevel, Integrity, Pipeline, Pooled, Transform};
pub use value::{Handle, Value, WireValue, MAX_DEPTH};
