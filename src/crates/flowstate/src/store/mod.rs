//! Checkpoint stores
//!
//! A [`CheckpointStore`] keeps serialized checkpoints under generated keys,
//! partitioned by [`Scope`]. Three backends are provided:
//!
//! | Store            | Retention                 | Key                          |
//! |------------------|---------------------------|------------------------------|
//! | [`SessionStore`] | bounded LRU per scope     | hex id                       |
//! | [`DurableStore`] | one SQLite row per put    | `hex id:hex discriminant`    |
//! | [`TokenStore`]   | none, the key is the data | URL-safe base64 token        |
//!
//! Every store accepts an optional [`Pipeline`](crate::transform::Pipeline)
//! applied to the bytes it keeps. A record is never returned for a scope
//! other than the one it was stored under, and a key that cannot be parsed
//! is treated as not found.

mod durable;
mod session;
mod token;

pub(crate) use durable::is_identifier;
pub use durable::{DurableStore, DEFAULT_TABLE};
pub use session::{SessionStore, DEFAULT_MAX_STATES};
pub use token::TokenStore;

use crate::error::Result;
use crate::stub::StubTable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition of a store, typically one user session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(String);

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A serialized checkpoint, with the stubs captured while serializing it
///
/// Only the in-process session store keeps `stubs`; other stores return an
/// empty table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointRecord {
    pub bytes: Vec<u8>,
    pub stubs: StubTable,
}

impl CheckpointRecord {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            stubs: StubTable::new(),
        }
    }

    pub fn with_stubs(mut self, stubs: StubTable) -> Self {
        self.stubs = stubs;
        self
    }
}

/// What to do when a content-derived key is already taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Replace the existing entry; equal keys mean equal checkpoints
    #[default]
    Overwrite,
    /// Fail with a duplicate-key error
    Reject,
}

/// Keyed, scope-partitioned checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Store a record and return its key
    async fn put(&self, scope: &Scope, record: CheckpointRecord) -> Result<String>;

    /// Fetch the record stored under `key` in `scope`
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<CheckpointRecord>>;
}
