//! Function identity index
//!
//! Every function of every loaded script gets a [`FunctionStub`] derived from
//! the script path and the function's nesting position. Stubs are independent
//! of which generation of the script is in memory, so a checkpoint taken
//! against one load of `flow.s` can be resumed against a later load of the
//! same (unchanged) file.
//!
//! # Concurrency
//!
//! Registrations are merged under a single writer lock into a fresh
//! [`IndexSnapshot`], which is then published by swapping an `Arc`. Readers
//! take the current snapshot and work on it without further locking, so a
//! resolve never waits for an unrelated script to finish loading and never
//! sees a half-merged script.
//!
//! # Superseded generations
//!
//! Reloading a script points its stubs at the new functions but keeps the
//! old handles' stubs, so computations still running old code can be
//! suspended again. Those entries accumulate with every reload until
//! [`FunctionIndex::prune_superseded`] drops the ones no live computation
//! or retained checkpoint still uses.

use crate::error::{CheckpointError, Result};
use crate::stub::FunctionStub;
use crate::value::Handle;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled function and the functions nested in it
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionNode {
    pub handle: Handle,
    pub name: Option<String>,
    pub children: Vec<FunctionNode>,
}

impl FunctionNode {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            name: None,
            children: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_child(mut self, child: FunctionNode) -> Self {
        self.children.push(child);
        self
    }
}

/// A compiled script: its path and the function tree rooted at the script body
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScript {
    pub path: String,
    pub root: FunctionNode,
}

impl CompiledScript {
    pub fn new(path: impl Into<String>, root: FunctionNode) -> Self {
        Self {
            path: path.into(),
            root,
        }
    }
}

/// Loads compiled scripts by path
pub trait ScriptSource: Send + Sync {
    /// Load (or return the cached current version of) a script; `None` if
    /// no script exists at `path`
    fn load(&self, path: &str) -> Result<Option<Arc<CompiledScript>>>;
}

/// Immutable published state of the index
#[derive(Debug, Default, Clone)]
pub struct IndexSnapshot {
    stubs: HashMap<Handle, FunctionStub>,
    functions: HashMap<FunctionStub, Handle>,
}

impl IndexSnapshot {
    pub fn stub_for(&self, handle: Handle) -> Option<&FunctionStub> {
        self.stubs.get(&handle)
    }

    pub fn function(&self, stub: &FunctionStub) -> Option<Handle> {
        self.functions.get(stub).copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Bidirectional index between script functions and their stubs
pub struct FunctionIndex {
    snapshot: RwLock<Arc<IndexSnapshot>>,
    merge: Mutex<()>,
    source: Option<Arc<dyn ScriptSource>>,
}

impl FunctionIndex {
    /// An index without a script source; it only knows registered scripts
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            merge: Mutex::new(()),
            source: None,
        }
    }

    /// An index that loads scripts from `source` on a resolve miss
    pub fn with_source(source: Arc<dyn ScriptSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::new()
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().clone()
    }

    /// Add all functions of a compiled script to the index
    pub fn register(&self, script: &CompiledScript) {
        let mut added = Vec::new();
        collect(&script.path, "", &script.root, &mut added);

        let _guard = self.merge.lock();
        let current = self.snapshot();
        let unchanged = added
            .iter()
            .all(|(stub, handle)| current.function(stub) == Some(*handle));
        if unchanged {
            return;
        }

        let mut next = (*current).clone();
        for (stub, handle) in added {
            next.stubs.insert(handle, stub.clone());
            next.functions.insert(stub, handle);
        }
        tracing::debug!(
            script = %script.path,
            functions = next.functions.len(),
            "Registered script functions"
        );
        *self.snapshot.write() = Arc::new(next);
    }

    /// Forget superseded function handles for which `in_use` returns false
    ///
    /// A handle is superseded when its stub now resolves to a different
    /// function. Returns how many handles were dropped.
    pub fn prune_superseded(&self, in_use: impl Fn(Handle) -> bool) -> usize {
        let _guard = self.merge.lock();
        let current = self.snapshot();
        let mut next = (*current).clone();
        next.stubs.retain(|handle, stub| {
            next.functions.get(stub) == Some(handle) || in_use(*handle)
        });
        let pruned = current.stubs.len() - next.stubs.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned superseded functions");
            *self.snapshot.write() = Arc::new(next);
        }
        pruned
    }

    /// Stub of a tracked function; `None` for functions no script defines
    pub fn stub_for(&self, handle: Handle) -> Option<FunctionStub> {
        self.snapshot().stub_for(handle).cloned()
    }

    /// Resolve a stub to the function currently occupying its position,
    /// loading the owning script if it is not indexed yet
    pub fn resolve(&self, stub: &FunctionStub) -> Result<Handle> {
        if let Some(handle) = self.snapshot().function(stub) {
            return Ok(handle);
        }
        tracing::debug!(stub = %stub, "Function not indexed, loading script");
        self.script(&stub.script)?;
        self.snapshot()
            .function(stub)
            .ok_or_else(|| CheckpointError::UnresolvedFunction(stub.clone()))
    }

    /// Load a script through the source and make sure it is indexed
    pub fn script(&self, path: &str) -> Result<Option<Arc<CompiledScript>>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        let script = source.load(path)?;
        if let Some(script) = &script {
            self.register(script);
        }
        Ok(script)
    }
}

impl Default for FunctionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FunctionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionIndex")
            .field("functions", &self.snapshot().len())
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

fn collect(path: &str, position: &str, node: &FunctionNode, out: &mut Vec<(FunctionStub, Handle)>) {
    out.push((FunctionStub::new(path, position), node.handle));
    for (i, child) in node.children.iter().enumerate() {
        collect(path, &FunctionStub::child_position(position, i), child, out);
    }
}
