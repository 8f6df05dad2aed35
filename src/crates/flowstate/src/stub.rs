//! Stubs: small serializable placeholders for objects that are never
//! embedded in a checkpoint by value

use crate::value::Handle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Placeholder for a named long-lived component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentStub {
    pub name: String,
}

impl ComponentStub {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ComponentStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub:{}", self.name)
    }
}

/// Placeholder for a script function, identified by its syntactic position
///
/// `position` is the nesting chain of the function inside its script: the
/// script body itself is `""`, its `n`th nested function is `"n."`, and the
/// `m`th function nested in that one is `"n.m."`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionStub {
    pub script: String,
    pub position: String,
}

impl FunctionStub {
    pub fn new(script: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            position: position.into(),
        }
    }

    /// Position path of the `index`th function nested in `parent`
    pub fn child_position(parent: &str, index: usize) -> String {
        format!("{}{}.", parent, index)
    }
}

impl fmt::Display for FunctionStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub:{}#{}", self.script, self.position)
    }
}

/// Any stub that can appear in a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stub {
    Component(ComponentStub),
    Function(FunctionStub),
    /// Context-specific stub issued by a caller's stub provider
    Context(String),
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stub::Component(stub) => stub.fmt(f),
            Stub::Function(stub) => stub.fmt(f),
            Stub::Context(id) => write!(f, "stub:context:{}", id),
        }
    }
}

impl From<ComponentStub> for Stub {
    fn from(stub: ComponentStub) -> Self {
        Stub::Component(stub)
    }
}

impl From<FunctionStub> for Stub {
    fn from(stub: FunctionStub) -> Self {
        Stub::Function(stub)
    }
}

/// Stubs captured during serialization, mapped to the handles they replaced
///
/// Kept alongside a checkpoint that stays in the same process so a local
/// resume reattaches to the exact objects that were live at suspension,
/// even if the owning script has been reloaded since.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StubTable {
    entries: HashMap<Stub, Handle>,
}

impl StubTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stub: Stub, handle: Handle) {
        self.entries.insert(stub, handle);
    }

    pub fn get(&self, stub: &Stub) -> Option<Handle> {
        self.entries.get(stub).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stubs(&self) -> impl Iterator<Item = &Stub> {
        self.entries.keys()
    }
}
