//! Checkpoint identifier policies
//!
//! Store keys are derived from non-negative 63-bit identifiers rendered as
//! lowercase hex. [`RandomIdGenerator`] draws them from a seeded RNG, so a
//! collision with an existing key is simply retried. [`ContentIdGenerator`]
//! derives them from the checkpoint bytes, so equal checkpoints get equal
//! keys and the store decides what a collision means.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Produces identifiers for new checkpoints
pub trait IdGenerator: Send + Sync {
    /// Identifier for a checkpoint with the given (untransformed) bytes;
    /// never greater than `i64::MAX`
    fn generate(&self, content: &[u8]) -> u64;

    /// Whether equal content always yields the same identifier
    fn is_content_derived(&self) -> bool;
}

/// Uniformly random identifiers
pub struct RandomIdGenerator {
    rng: Mutex<StdRng>,
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence, for tests
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIdGenerator {
    fn generate(&self, _content: &[u8]) -> u64 {
        self.rng.lock().gen::<u64>() & i64::MAX as u64
    }

    fn is_content_derived(&self) -> bool {
        false
    }
}

/// Identifiers derived from a SHA-256 of the checkpoint bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentIdGenerator;

impl IdGenerator for ContentIdGenerator {
    fn generate(&self, content: &[u8]) -> u64 {
        let digest = Sha256::digest(content);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) & i64::MAX as u64
    }

    fn is_content_derived(&self) -> bool {
        true
    }
}

/// Render an identifier as a store key
pub fn format_key(id: u64) -> String {
    assert!(id <= i64::MAX as u64, "checkpoint id {} out of range", id);
    format!("{:x}", id)
}

/// Parse a key produced by [`format_key`]; `None` for anything else
pub fn parse_key(key: &str) -> Option<u64> {
    if key.is_empty() || key.len() > 16 || key.starts_with('+') {
        return None;
    }
    u64::from_str_radix(key, 16)
        .ok()
        .filter(|id| *id <= i64::MAX as u64)
}
