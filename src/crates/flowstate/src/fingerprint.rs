//! Fingerprinting of the code on a suspended stack
//!
//! A checkpoint stores the return addresses of every frame on the suspended
//! stack. Those addresses are only meaningful against the exact compiled code
//! they were taken from: resuming a checkpoint after the script was edited
//! would jump into the middle of different code. To detect this, the codec
//! records one SHA-256 fingerprint per frame when suspending, and verifies the
//! rebuilt computation's frames against them before it is handed back.
//!
//! Fingerprints are ordered innermost frame first, following
//! [`Engine::walk_frames`]. This order is part of the checkpoint format.

use crate::engine::{CodeId, Engine, Frame};
use crate::error::{CheckpointError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Default number of code objects whose fingerprints are memoized
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// SHA-256 digest of one frame's compiled code
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

struct CacheInner {
    entries: HashMap<CodeId, Fingerprint>,
    order: VecDeque<CodeId>,
}

/// Bounded memo of fingerprints by code identity
///
/// Code ids are never reused for different code, so an entry never goes
/// stale; the bound only limits memory held for code that has since been
/// recompiled.
pub struct FingerprintCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl FingerprintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, code: CodeId) -> Option<Fingerprint> {
        self.inner.lock().entries.get(&code).copied()
    }

    pub fn insert(&self, code: CodeId, fingerprint: Fingerprint) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(code, fingerprint).is_some() {
            return;
        }
        inner.order.push_back(code);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Computes and verifies stack fingerprints
#[derive(Clone, Default)]
pub struct FingerprintVerifier {
    cache: Arc<FingerprintCache>,
}

impl FingerprintVerifier {
    pub fn new(cache: Arc<FingerprintCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    fn fingerprint_frame<E: Engine>(&self, engine: &E, frame: &Frame) -> Result<Fingerprint> {
        if let Some(fingerprint) = self.cache.get(frame.code) {
            return Ok(fingerprint);
        }
        let fingerprint = Fingerprint::of(&engine.compiled_code_bytes_of(frame)?);
        self.cache.insert(frame.code, fingerprint);
        Ok(fingerprint)
    }

    /// Fingerprints of every frame, innermost first
    pub fn compute<E: Engine>(&self, engine: &E, computation: &E::Computation) -> Result<Vec<Fingerprint>> {
        engine
            .walk_frames(computation)?
            .iter()
            .map(|frame| self.fingerprint_frame(engine, frame))
            .collect()
    }

    /// Check that the computation runs exactly the code the fingerprints were taken from
    pub fn verify<E: Engine>(
        &self,
        engine: &E,
        computation: &E::Computation,
        expected: &[Fingerprint],
    ) -> Result<()> {
        let frames = engine.walk_frames(computation)?;
        if frames.len() != expected.len() {
            tracing::warn!(
                expected = expected.len(),
                actual = frames.len(),
                "Checkpoint stack depth does not match"
            );
            return Err(CheckpointError::FrameCountMismatch {
                expected: expected.len(),
                actual: frames.len(),
            });
        }
        for (frame, expected) in frames.iter().zip(expected) {
            let actual = self.fingerprint_frame(engine, frame)?;
            if actual != *expected {
                tracing::warn!(
                    function = %frame.function,
                    script = %frame.source,
                    %expected,
                    %actual,
                    "Function changed since checkpoint was taken"
                );
                return Err(CheckpointError::FingerprintMismatch {
                    function: frame.function.clone(),
                    source_name: frame.source.clone(),
                });
            }
        }
        Ok(())
    }

    /// Human-readable listing of the stack with each frame's fingerprint
    pub fn describe_stack<E: Engine>(&self, engine: &E, computation: &E::Computation) -> Result<String> {
        let mut out = String::new();
        for frame in engine.walk_frames(computation)? {
            let fingerprint = self.fingerprint_frame(engine, &frame)?;
            out.push_str(&format!(
                "  at {} ({}) [{}]\n",
                frame.function, frame.source, fingerprint
            ));
        }
        Ok(out)
    }
}

impl fmt::Debug for FingerprintVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintVerifier")
            .field("cached", &self.cache.len())
            .finish()
    }
}
