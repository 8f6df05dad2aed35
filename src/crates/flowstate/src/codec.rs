//! Checkpoint codec
//!
//! Turns a suspended computation into bytes and back. The computation's
//! object graph is written with three kinds of substitution:
//!
//! - references to named components become [`ComponentStub`]s, resolved by
//!   name against the current [`ReferenceRegistry`] on load
//! - references to script functions become [`FunctionStub`]s, resolved
//!   against the [`FunctionIndex`] on load (reloading the script if needed)
//! - objects of excluded runtime helper classes become named markers and are
//!   rebound through [`Engine::runtime_helper`] on load
//!
//! Callers may also supply a [`StubProvider`] that stubs context-bound
//! objects (e.g. a user session) under their own identifiers, and a matching
//! [`StubResolver`] for the way back.
//!
//! # Wire format
//!
//! ```text
//! +-------+---------+----------------------+-----------------------+
//! | FLST  | version | fingerprints         | payload               |
//! | 4 B   | 1 B     | bincode Vec<[u8;32]> | bincode WireValue     |
//! +-------+---------+----------------------+-----------------------+
//! ```
//!
//! Fingerprints are ordered innermost frame first. The whole checkpoint is
//! bounded by a size limit, lists and objects nest at most
//! [`MAX_DEPTH`] levels, and trailing bytes after the payload are rejected.
//!
//! [`ComponentStub`]: crate::stub::ComponentStub
//! [`FunctionStub`]: crate::stub::FunctionStub

use crate::engine::Engine;
use crate::error::{CheckpointError, Result};
use crate::fingerprint::{Fingerprint, FingerprintVerifier};
use crate::index::{FunctionIndex, IndexSnapshot};
use crate::registry::ReferenceRegistry;
use crate::stub::{Stub, StubTable};
use crate::value::{Handle, Value, WireValue, MAX_DEPTH};
use bincode::Options;
use std::collections::HashSet;
use std::sync::Arc;

/// Leading bytes of every checkpoint
pub const MAGIC: &[u8; 4] = b"FLST";

/// Current checkpoint format version
pub const FORMAT_VERSION: u8 = 1;

/// Default upper bound for a serialized checkpoint
pub const DEFAULT_SIZE_LIMIT: u64 = 16 * 1024 * 1024;

const HEADER_LEN: usize = MAGIC.len() + 1;

/// Issues stubs for context-bound objects the registry and index do not know
pub trait StubProvider: Send + Sync {
    /// Identifier for `handle`, or `None` if the provider does not own it
    fn stub_for(&self, handle: Handle) -> Option<String>;
}

/// Resolves stubs before the built-in resolution steps are tried
pub trait StubResolver: Send + Sync {
    /// `Ok(None)` passes the stub on to the next resolution step
    fn resolve(&self, stub: &Stub) -> Result<Option<Handle>>;
}

/// What a checkpoint references, readable without an engine
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub version: u8,
    pub fingerprints: Vec<Fingerprint>,
    /// Distinct stubs in order of first appearance
    pub stubs: Vec<Stub>,
    /// Distinct excluded helper classes in order of first appearance
    pub excluded: Vec<String>,
    pub size: usize,
}

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit)
}

fn decode(bytes: &[u8], limit: u64) -> Result<(u8, Vec<Fingerprint>, WireValue)> {
    if bytes.len() as u64 > limit {
        return Err(CheckpointError::corrupt(format!(
            "{} bytes exceed the limit of {} bytes",
            bytes.len(),
            limit
        )));
    }
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(CheckpointError::corrupt("missing checkpoint header"));
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(CheckpointError::corrupt(format!(
            "unsupported format version {}",
            version
        )));
    }

    let mut reader = &bytes[HEADER_LEN..];
    let fingerprints: Vec<Fingerprint> = options(limit)
        .deserialize_from(&mut reader)
        .map_err(|e| CheckpointError::corrupt(format!("fingerprints: {}", e)))?;
    let payload: WireValue = options(limit)
        .deserialize_from(&mut reader)
        .map_err(|e| CheckpointError::corrupt(format!("payload: {}", e)))?;
    if !reader.is_empty() {
        return Err(CheckpointError::corrupt(format!(
            "{} trailing bytes",
            reader.len()
        )));
    }
    Ok((version, fingerprints, payload))
}

/// Summarize a checkpoint without resolving anything
pub fn inspect(bytes: &[u8]) -> Result<CheckpointSummary> {
    inspect_with_limit(bytes, DEFAULT_SIZE_LIMIT)
}

/// [`inspect`] with a size limit other than the default
pub fn inspect_with_limit(bytes: &[u8], limit: u64) -> Result<CheckpointSummary> {
    let (version, fingerprints, payload) = decode(bytes, limit)?;
    let mut stubs = Vec::new();
    let mut excluded = Vec::new();
    payload.walk(&mut |node| match node {
        WireValue::Stub(stub) if !stubs.contains(stub) => stubs.push(stub.clone()),
        WireValue::Excluded(class) if !excluded.contains(class) => excluded.push(class.clone()),
        _ => {}
    });
    Ok(CheckpointSummary {
        version,
        fingerprints,
        stubs,
        excluded,
        size: bytes.len(),
    })
}

/// Serializes and deserializes suspended computations of one engine
pub struct CheckpointCodec<E: Engine> {
    engine: Arc<E>,
    registry: Arc<ReferenceRegistry>,
    index: Arc<FunctionIndex>,
    verifier: FingerprintVerifier,
    excluded: HashSet<String>,
    size_limit: u64,
}

impl<E: Engine> CheckpointCodec<E> {
    pub fn new(
        engine: Arc<E>,
        registry: Arc<ReferenceRegistry>,
        index: Arc<FunctionIndex>,
        verifier: FingerprintVerifier,
    ) -> Self {
        Self {
            engine,
            registry,
            index,
            verifier,
            excluded: HashSet::new(),
            size_limit: DEFAULT_SIZE_LIMIT,
        }
    }

    /// Never serialize objects of `class`; rebind them by name on load
    pub fn exclude(mut self, class: impl Into<String>) -> Self {
        self.excluded.insert(class.into());
        self
    }

    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn index(&self) -> &Arc<FunctionIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<ReferenceRegistry> {
        &self.registry
    }

    pub fn verifier(&self) -> &FingerprintVerifier {
        &self.verifier
    }

    /// Serialize a suspended computation
    ///
    /// Every stub written is also recorded in `capture`, if given.
    pub fn serialize(
        &self,
        computation: &E::Computation,
        capture: Option<&mut StubTable>,
        provider: Option<&dyn StubProvider>,
    ) -> Result<Vec<u8>> {
        let fingerprints = self.verifier.compute(&*self.engine, computation)?;
        let graph = self.engine.object_graph(computation)?;
        let snapshot = self.index.snapshot();
        let mut writer = Writer {
            registry: &self.registry,
            index: &snapshot,
            excluded: &self.excluded,
            provider,
            capture,
            stubs: 0,
        };
        let payload = writer.write(graph, MAX_DEPTH)?;

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        options(self.size_limit).serialize_into(&mut out, &fingerprints)?;
        options(self.size_limit).serialize_into(&mut out, &payload)?;
        if out.len() as u64 > self.size_limit {
            return Err(CheckpointError::TooLarge {
                size: out.len() as u64,
                limit: self.size_limit,
            });
        }

        tracing::debug!(
            bytes = out.len(),
            frames = fingerprints.len(),
            stubs = writer.stubs,
            "Serialized checkpoint"
        );
        Ok(out)
    }

    /// Rebuild a computation from checkpoint bytes and verify its code
    pub fn deserialize(
        &self,
        bytes: &[u8],
        resolver: Option<&dyn StubResolver>,
        local: Option<&StubTable>,
    ) -> Result<E::Computation> {
        let (_, fingerprints, payload) = decode(bytes, self.size_limit)?;
        let graph = self.read(payload, resolver, local, MAX_DEPTH)?;
        let computation = self.engine.rebuild(graph)?;
        self.verifier
            .verify(&*self.engine, &computation, &fingerprints)?;
        tracing::debug!(
            bytes = bytes.len(),
            frames = fingerprints.len(),
            "Deserialized checkpoint"
        );
        Ok(computation)
    }

    fn read(
        &self,
        wire: WireValue,
        resolver: Option<&dyn StubResolver>,
        local: Option<&StubTable>,
        depth: usize,
    ) -> Result<Value> {
        let nested = || {
            depth.checked_sub(1).ok_or_else(|| {
                CheckpointError::corrupt(format!("value nests deeper than {} levels", MAX_DEPTH))
            })
        };
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => {
                let depth = nested()?;
                Value::List(
                    items
                        .into_iter()
                        .map(|item| self.read(item, resolver, local, depth))
                        .collect::<Result<_>>()?,
                )
            }
            WireValue::Object { class, fields } => {
                let depth = nested()?;
                Value::Object {
                    class,
                    fields: fields
                        .into_iter()
                        .map(|(name, value)| {
                            self.read(value, resolver, local, depth).map(|v| (name, v))
                        })
                        .collect::<Result<_>>()?,
                }
            }
            WireValue::Stub(stub) => Value::Ref(self.resolve_stub(&stub, resolver, local)?),
            WireValue::Excluded(class) => self.engine.runtime_helper(&class).ok_or_else(|| {
                CheckpointError::unresolved(
                    format!("runtime:{}", class),
                    "engine has no runtime helper of this class",
                )
            })?,
        })
    }

    fn resolve_stub(
        &self,
        stub: &Stub,
        resolver: Option<&dyn StubResolver>,
        local: Option<&StubTable>,
    ) -> Result<Handle> {
        if let Some(resolver) = resolver {
            match resolver.resolve(stub) {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {}
                Err(e) => return Err(CheckpointError::unresolved(stub, e.to_string())),
            }
        }
        if let Some(handle) = local.and_then(|table| table.get(stub)) {
            return Ok(handle);
        }
        match stub {
            Stub::Function(function) => self
                .index
                .resolve(function)
                .map_err(|e| CheckpointError::unresolved(stub, e.to_string())),
            Stub::Component(component) => self
                .registry
                .resolve(component)
                .map_err(|e| CheckpointError::unresolved(stub, e.to_string())),
            Stub::Context(_) => Err(CheckpointError::unresolved(
                stub,
                "no resolver claimed this context stub",
            )),
        }
    }
}

struct Writer<'a> {
    registry: &'a ReferenceRegistry,
    index: &'a IndexSnapshot,
    excluded: &'a HashSet<String>,
    provider: Option<&'a dyn StubProvider>,
    capture: Option<&'a mut StubTable>,
    stubs: usize,
}

impl Writer<'_> {
    fn write(&mut self, value: Value, depth: usize) -> Result<WireValue> {
        let nested = || depth.checked_sub(1).ok_or(CheckpointError::NestingTooDeep(MAX_DEPTH));
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(b),
            Value::Int(i) => WireValue::Int(i),
            Value::Float(f) => WireValue::Float(f),
            Value::Str(s) => WireValue::Str(s),
            Value::Bytes(b) => WireValue::Bytes(b),
            Value::List(items) => {
                let depth = nested()?;
                WireValue::List(
                    items
                        .into_iter()
                        .map(|item| self.write(item, depth))
                        .collect::<Result<_>>()?,
                )
            }
            Value::Object { class, .. } if self.excluded.contains(&class) => {
                WireValue::Excluded(class)
            }
            Value::Object { class, fields } => {
                let depth = nested()?;
                WireValue::Object {
                    class,
                    fields: fields
                        .into_iter()
                        .map(|(name, value)| self.write(value, depth).map(|v| (name, v)))
                        .collect::<Result<_>>()?,
                }
            }
            Value::Ref(handle) => WireValue::Stub(self.stub(handle)?),
        })
    }

    fn stub(&mut self, handle: Handle) -> Result<Stub> {
        let stub = if let Some(component) = self.registry.stub_for(handle) {
            Stub::Component(component)
        } else if let Some(id) = self.provider.and_then(|p| p.stub_for(handle)) {
            Stub::Context(id)
        } else if let Some(function) = self.index.stub_for(handle) {
            Stub::Function(function.clone())
        } else {
            return Err(CheckpointError::Unstubbable(handle));
        };
        if let Some(capture) = self.capture.as_deref_mut() {
            capture.insert(stub.clone(), handle);
        }
        self.stubs += 1;
        Ok(stub)
    }
}

impl<E: Engine> std::fmt::Debug for CheckpointCodec<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCodec")
            .field("registry", &self.registry)
            .field("index", &self.index)
            .field("excluded", &self.excluded)
            .field("size_limit", &self.size_limit)
            .finish()
    }
}
