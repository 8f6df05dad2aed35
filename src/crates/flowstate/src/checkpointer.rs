//! Suspend and resume through a codec and a store

use crate::codec::{CheckpointCodec, StubProvider, StubResolver};
use crate::engine::Engine;
use crate::error::Result;
use crate::store::{CheckpointRecord, CheckpointStore, Scope, SessionStore};
use crate::stub::StubTable;
use std::sync::Arc;

/// Couples a [`CheckpointCodec`] with a [`CheckpointStore`]
pub struct Checkpointer<E: Engine> {
    codec: Arc<CheckpointCodec<E>>,
    store: Arc<dyn CheckpointStore>,
}

impl<E: Engine> Clone for Checkpointer<E> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            store: self.store.clone(),
        }
    }
}

impl<E: Engine> Checkpointer<E> {
    pub fn new(codec: Arc<CheckpointCodec<E>>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { codec, store }
    }

    pub fn codec(&self) -> &Arc<CheckpointCodec<E>> {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Serialize and store a suspended computation; returns its key
    pub async fn suspend(&self, scope: &Scope, computation: &E::Computation) -> Result<String> {
        self.suspend_with(scope, computation, None).await
    }

    /// Like [`suspend`](Self::suspend), with a provider for context-bound objects
    pub async fn suspend_with(
        &self,
        scope: &Scope,
        computation: &E::Computation,
        provider: Option<&dyn StubProvider>,
    ) -> Result<String> {
        let mut stubs = StubTable::new();
        let bytes = self.codec.serialize(computation, Some(&mut stubs), provider)?;
        self.store
            .put(scope, CheckpointRecord::new(bytes).with_stubs(stubs))
            .await
    }

    /// Fetch and rebuild the computation stored under `key`
    ///
    /// `Ok(None)` when the store has nothing under that key in this scope.
    pub async fn resume(&self, scope: &Scope, key: &str) -> Result<Option<E::Computation>> {
        self.resume_with(scope, key, None).await
    }

    /// Like [`resume`](Self::resume), with a resolver for context-bound stubs
    pub async fn resume_with(
        &self,
        scope: &Scope,
        key: &str,
        resolver: Option<&dyn StubResolver>,
    ) -> Result<Option<E::Computation>> {
        let Some(record) = self.store.get(scope, key).await? else {
            tracing::debug!(store = self.store.name(), %scope, %key, "No checkpoint to resume");
            return Ok(None);
        };
        let local = (!record.stubs.is_empty()).then_some(&record.stubs);
        self.codec
            .deserialize(&record.bytes, resolver, local)
            .map(Some)
    }

    /// Rebuild every checkpoint a session scope holds, least recently used
    /// first, and hand each to `visit`; checkpoints that fail to rebuild are
    /// logged and skipped. Returns the number visited.
    pub fn visit_scope<F>(&self, sessions: &SessionStore, scope: &Scope, mut visit: F) -> Result<usize>
    where
        F: FnMut(&str, E::Computation),
    {
        let mut visited = 0;
        for (key, record) in sessions.entries(scope)? {
            match self
                .codec
                .deserialize(&record.bytes, None, Some(&record.stubs))
            {
                Ok(computation) => {
                    visit(&key, computation);
                    visited += 1;
                }
                Err(e) => {
                    tracing::warn!(%scope, %key, error = %e, "Skipping checkpoint that failed to rebuild");
                }
            }
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintVerifier;
    use crate::index::FunctionIndex;
    use crate::registry::ReferenceRegistry;
    use crate::store::TokenStore;
    use crate::testing::{ScriptedEngine, HOST_CLASS};
    use crate::value::Value;

    const FLOW: &str = "ask first?\nask second?\n";

    fn setup(store: Arc<dyn CheckpointStore>) -> (Arc<ScriptedEngine>, Checkpointer<ScriptedEngine>) {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_source("flow.s", FLOW);
        let codec = CheckpointCodec::new(
            engine.clone(),
            Arc::new(ReferenceRegistry::new(engine.clone())),
            Arc::new(FunctionIndex::with_source(engine.clone())),
            FingerprintVerifier::default(),
        )
        .exclude(HOST_CLASS);
        (engine.clone(), Checkpointer::new(Arc::new(codec), store))
    }

    #[tokio::test]
    async fn test_suspend_resume() {
        let (engine, checkpointer) = setup(Arc::new(SessionStore::default()));
        let scope = Scope::new("s");
        let computation = engine.start("flow.s").unwrap().into_suspended().unwrap();
        checkpointer.codec().index().script("flow.s").unwrap();

        let key = checkpointer.suspend(&scope, &computation).await.unwrap();
        let restored = checkpointer.resume(&scope, &key).await.unwrap().unwrap();
        let step = engine.resume(restored, Value::from("a")).unwrap();
        assert_eq!(step.output(), &Value::from("second?"));
    }

    #[tokio::test]
    async fn test_resume_missing_key() {
        let (_, checkpointer) = setup(Arc::new(TokenStore::new()));
        assert!(checkpointer
            .resume(&Scope::new("s"), "@@@")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_visit_scope_skips_broken_checkpoints() {
        let sessions = Arc::new(SessionStore::default());
        let (engine, checkpointer) = setup(sessions.clone());
        let scope = Scope::new("s");
        checkpointer.codec().index().script("flow.s").unwrap();
        let computation = engine.start("flow.s").unwrap().into_suspended().unwrap();
        checkpointer.suspend(&scope, &computation).await.unwrap();
        sessions
            .put(&scope, CheckpointRecord::new(b"not a checkpoint".to_vec()))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let visited = checkpointer
            .visit_scope(&sessions, &scope, |key, computation| {
                seen.push((key.to_string(), computation.answers().len()))
            })
            .unwrap();
        assert_eq!(visited, 1);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 0);
    }
}
