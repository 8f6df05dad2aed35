//! In-memory session store
//!
//! Keeps the most recently used checkpoints of every scope in memory. Each
//! scope is capped at `max_states` entries; storing one more evicts the
//! entry that was least recently stored or fetched. Records keep the stub
//! table captured at serialization, so a resume in the same process can
//! reattach to the exact function objects that were live at suspension.
//!
//! ```text
//! DashMap<Scope, Arc<Mutex<LruStates>>>
//!   "session-a" -> [k3 (oldest), k1, k7 (newest)]
//!   "session-b" -> [k2]
//! ```
//!
//! Mutations of one scope are serialized by that scope's lock. Different
//! scopes never contend. Removing a scope marks its map as removed under
//! the same lock, so a `put` that raced with the removal stores into a fresh
//! map instead of the detached one.

use super::{CheckpointRecord, CheckpointStore, CollisionPolicy, Scope};
use crate::error::{CheckpointError, Result};
use crate::id::{format_key, parse_key, IdGenerator, RandomIdGenerator};
use crate::transform::Pipeline;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Default per-scope capacity
pub const DEFAULT_MAX_STATES: usize = 100;

#[derive(Default)]
struct LruStates {
    entries: HashMap<u64, (u64, CheckpointRecord)>,
    order: BTreeMap<u64, u64>,
    tick: u64,
    removed: bool,
}

impl LruStates {
    fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, id: u64) -> Option<CheckpointRecord> {
        let tick = self.next_tick();
        let (used, record) = self.entries.get_mut(&id)?;
        self.order.remove(&*used);
        *used = tick;
        self.order.insert(tick, id);
        Some(record.clone())
    }

    /// Insert or replace; returns the id evicted to stay within `capacity`
    fn insert(&mut self, id: u64, record: CheckpointRecord, capacity: usize) -> Option<u64> {
        let tick = self.next_tick();
        if let Some((used, _)) = self.entries.insert(id, (tick, record)) {
            self.order.remove(&used);
        }
        self.order.insert(tick, id);

        if self.entries.len() <= capacity {
            return None;
        }
        let (_, oldest) = self.order.pop_first()?;
        self.entries.remove(&oldest);
        Some(oldest)
    }

    fn snapshot(&self) -> Vec<(u64, CheckpointRecord)> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id).map(|(_, r)| (*id, r.clone())))
            .collect()
    }
}

fn held(slot: &Mutex<LruStates>) -> usize {
    slot.lock().entries.len()
}

/// Bounded in-memory store, one LRU map per scope
pub struct SessionStore {
    scopes: DashMap<Scope, Arc<Mutex<LruStates>>>,
    max_states: usize,
    ids: Arc<dyn IdGenerator>,
    collisions: CollisionPolicy,
    pipeline: Option<Pipeline>,
}

impl SessionStore {
    /// A store keeping at most `max_states` checkpoints per scope
    pub fn new(max_states: usize) -> Result<Self> {
        if max_states == 0 {
            return Err(CheckpointError::Config(
                "max_states must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            scopes: DashMap::new(),
            max_states,
            ids: Arc::new(RandomIdGenerator::new()),
            collisions: CollisionPolicy::default(),
            pipeline: None,
        })
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Behavior when a content-derived id is already present
    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collisions = policy;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn max_states(&self) -> usize {
        self.max_states
    }

    fn slot(&self, scope: &Scope) -> Option<Arc<Mutex<LruStates>>> {
        self.scopes.get(scope).map(|slot| slot.clone())
    }

    fn decode(&self, record: CheckpointRecord) -> Result<CheckpointRecord> {
        Ok(match &self.pipeline {
            Some(pipeline) => CheckpointRecord {
                bytes: pipeline.decode(record.bytes)?,
                stubs: record.stubs,
            },
            None => record,
        })
    }

    /// Run `f` on the live map of `scope`, creating it if needed
    fn with_live_slot<T>(&self, scope: &Scope, f: impl FnOnce(&mut LruStates) -> T) -> T {
        loop {
            let slot = self.scopes.entry(scope.clone()).or_default().clone();
            let mut states = slot.lock();
            if !states.removed {
                return f(&mut *states);
            }
            drop(states);
            self.scopes
                .remove_if(scope, |_, current| Arc::ptr_eq(current, &slot));
        }
    }

    /// Drop every checkpoint of a scope; returns how many were held
    pub fn remove_scope(&self, scope: &Scope) -> usize {
        let removed = self
            .scopes
            .remove(scope)
            .map(|(_, slot)| {
                let mut states = slot.lock();
                states.removed = true;
                states.entries.len()
            })
            .unwrap_or(0);
        tracing::debug!(%scope, removed, "Removed session scope");
        removed
    }

    /// Number of checkpoints held for a scope
    pub fn scope_len(&self, scope: &Scope) -> usize {
        self.slot(scope).map(|slot| held(&slot)).unwrap_or(0)
    }

    /// Number of scopes with at least one stored checkpoint
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// All checkpoints of a scope, least recently used first, without
    /// refreshing their recency
    pub fn entries(&self, scope: &Scope) -> Result<Vec<(String, CheckpointRecord)>> {
        let Some(slot) = self.slot(scope) else {
            return Ok(Vec::new());
        };
        let snapshot = slot.lock().snapshot();
        snapshot
            .into_iter()
            .map(|(id, record)| self.decode(record).map(|record| (format_key(id), record)))
            .collect()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self {
            scopes: DashMap::new(),
            max_states: DEFAULT_MAX_STATES,
            ids: Arc::new(RandomIdGenerator::new()),
            collisions: CollisionPolicy::default(),
            pipeline: None,
        }
    }
}

#[async_trait]
impl CheckpointStore for SessionStore {
    fn name(&self) -> &'static str {
        "session"
    }

    #[tracing::instrument(skip(self, record), fields(bytes = record.bytes.len()))]
    async fn put(&self, scope: &Scope, record: CheckpointRecord) -> Result<String> {
        let mut id = self.ids.generate(&record.bytes);
        let bytes = match &self.pipeline {
            Some(pipeline) => pipeline.encode(record.bytes)?,
            None => record.bytes,
        };
        let stored = CheckpointRecord {
            bytes,
            stubs: record.stubs,
        };

        let max_states = self.max_states;
        let id = self.with_live_slot(scope, |states| {
            if self.ids.is_content_derived() {
                if states.contains(id) {
                    match self.collisions {
                        CollisionPolicy::Reject => {
                            return Err(CheckpointError::DuplicateKey(format_key(id)));
                        }
                        CollisionPolicy::Overwrite => {
                            tracing::debug!(key = %format_key(id), "Overwriting checkpoint with identical key");
                        }
                    }
                }
            } else {
                while states.contains(id) {
                    id = self.ids.generate(&stored.bytes);
                }
            }
            if let Some(evicted) = states.insert(id, stored, max_states) {
                tracing::debug!(evicted = %format_key(evicted), "Evicted least recently used checkpoint");
            }
            Ok(id)
        })?;

        let key = format_key(id);
        tracing::debug!(%key, "Stored checkpoint");
        Ok(key)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<CheckpointRecord>> {
        let Some(id) = parse_key(key) else {
            return Ok(None);
        };
        let Some(slot) = self.slot(scope) else {
            return Ok(None);
        };
        let record = slot.lock().get(id);
        match record {
            Some(record) => Ok(Some(self.decode(record)?)),
            None => {
                tracing::debug!("Checkpoint not found");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("scopes", &self.scopes.len())
            .field("max_states", &self.max_states)
            .field("collisions", &self.collisions)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
