//! Reference registry for named long-lived components
//!
//! Configuration singletons, caches, service objects and similar components
//! are shared by every running flow. A checkpoint must not carry copies of
//! them; instead each reference is written as a [`ComponentStub`] holding the
//! component's name, and on resume the name is looked up again in whatever
//! container is current. This keeps checkpoints small and lets them survive a
//! process restart in which the component is reconstructed rather than
//! reloaded.
//!
//! The registry is built once from a [`ComponentSource`] (the dependency
//! injection container) and is read-only afterwards.

use crate::error::{CheckpointError, Result};
use crate::stub::ComponentStub;
use crate::value::Handle;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Container of named components
pub trait ComponentSource: Send + Sync {
    /// Names of all components currently defined
    fn component_names(&self) -> Vec<String>;

    /// Current handle of the named component
    fn lookup(&self, name: &str) -> Option<Handle>;
}

/// Maps component handles to stubs and stubs back to current components
pub struct ReferenceRegistry {
    source: Arc<dyn ComponentSource>,
    stubs: HashMap<Handle, ComponentStub>,
    names: HashSet<String>,
}

impl ReferenceRegistry {
    /// Snapshot the components the source defines right now
    pub fn new(source: Arc<dyn ComponentSource>) -> Self {
        let mut stubs = HashMap::new();
        let mut names = HashSet::new();
        for name in source.component_names() {
            let Some(handle) = source.lookup(&name) else {
                tracing::debug!(component = %name, "Component listed but not resolvable, skipping");
                continue;
            };
            if let Some(existing) = stubs.get(&handle) {
                tracing::debug!(
                    component = %name,
                    canonical = %existing,
                    "Component aliases an already registered instance"
                );
                continue;
            }
            names.insert(name.clone());
            stubs.insert(handle, ComponentStub::new(name));
        }
        tracing::debug!(components = stubs.len(), "Reference registry built");
        Self {
            source,
            stubs,
            names,
        }
    }

    /// Stub for a component, or `None` if the handle is not a registered component
    pub fn stub_for(&self, handle: Handle) -> Option<ComponentStub> {
        self.stubs.get(&handle).cloned()
    }

    /// Resolve a stub to the component currently registered under its name
    pub fn resolve(&self, stub: &ComponentStub) -> Result<Handle> {
        self.source
            .lookup(&stub.name)
            .ok_or_else(|| CheckpointError::BrokenReference(stub.name.clone()))
    }

    /// Whether a name was known when the registry was built
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

impl std::fmt::Debug for ReferenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceRegistry")
            .field("components", &self.stubs.len())
            .finish()
    }
}
