//! Reversible byte transforms applied to checkpoints on their way to and
//! from a store
//!
//! A [`Transform`] hands out [`Coder`]s: stateful, single-call-at-a-time
//! instances that encode or decode one buffer. A [`Pipeline`] chains
//! transforms, encoding in declared order and decoding in reverse, and is
//! itself a transform. [`Pooled`] keeps idle coders around for reuse.
//!
//! ```text
//! encode:  bytes -> Compression -> Integrity -> stored
//! decode:  stored -> Integrity -> Compression -> bytes
//! ```

mod compression;
mod integrity;
mod pool;

pub use compression::{Compression, CompressionLevel, DEFAULT_OUTPUT_LIMIT, ENVELOPE_ALLOWANCE};
pub use integrity::{Integrity, TAG_LEN};
pub use pool::{PoolGuard, Pooled};

use crate::error::{CheckpointError, Result};
use std::sync::Arc;

/// One encoder or decoder instance
pub trait Coder: Send {
    fn code(&mut self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// A reversible byte transform
pub trait Transform: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn encoder(&self) -> Result<Box<dyn Coder>>;

    fn decoder(&self) -> Result<Box<dyn Coder>>;
}

/// Ordered chain of transforms
#[derive(Clone, Default)]
pub struct Pipeline {
    transforms: Vec<Arc<dyn Transform>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transform; it runs after the ones already added when encoding
    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.push(Arc::new(transform));
        self
    }

    pub fn push(&mut self, transform: Arc<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.transforms.iter().try_fold(data, |data, transform| {
            transform.encoder()?.code(data)
        })
    }

    /// Decode stored bytes; a transform that cannot decode them reports a
    /// corrupt checkpoint
    pub fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.transforms
            .iter()
            .rev()
            .try_fold(data, |data, transform| transform.decoder()?.code(data))
            .map_err(CheckpointError::into_decode_failure)
    }
}

struct Chain(Vec<Box<dyn Coder>>);

impl Coder for Chain {
    fn code(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.0.iter_mut().try_fold(data, |data, coder| coder.code(data))
    }
}

impl Transform for Pipeline {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn encoder(&self) -> Result<Box<dyn Coder>> {
        let coders = self
            .transforms
            .iter()
            .map(|t| t.encoder())
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Chain(coders)))
    }

    fn decoder(&self) -> Result<Box<dyn Coder>> {
        let coders = self
            .transforms
            .iter()
            .rev()
            .map(|t| t.decoder())
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Chain(coders)))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Encode through an optional transform
pub fn encode(transform: Option<&dyn Transform>, data: Vec<u8>) -> Result<Vec<u8>> {
    match transform {
        Some(transform) => transform.encoder()?.code(data),
        None => Ok(data),
    }
}

/// Decode through an optional transform
pub fn decode(transform: Option<&dyn Transform>, data: Vec<u8>) -> Result<Vec<u8>> {
    match transform {
        Some(transform) => transform
            .decoder()?
            .code(data)
            .map_err(CheckpointError::into_decode_failure),
        None => Ok(data),
    }
}
