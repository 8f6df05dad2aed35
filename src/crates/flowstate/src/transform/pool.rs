//! Pooling of coder instances
//!
//! Coders may be expensive to set up (compression state, keyed MACs). A
//! [`Pooled`] transform hands out an idle coder when one is available and
//! builds a new one otherwise. The coder goes back to the pool when its
//! [`PoolGuard`] is dropped, whether or not the call succeeded.

use super::{Coder, Transform};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default number of idle coders kept per direction
pub const DEFAULT_MAX_IDLE: usize = 16;

type Idle = Arc<Mutex<Vec<Box<dyn Coder>>>>;

/// A transform whose coders are reused
pub struct Pooled<T: Transform> {
    inner: T,
    encoders: Idle,
    decoders: Idle,
    max_idle: usize,
}

impl<T: Transform> Pooled<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            encoders: Arc::default(),
            decoders: Arc::default(),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Idle (encoders, decoders)
    pub fn idle(&self) -> (usize, usize) {
        (self.encoders.lock().len(), self.decoders.lock().len())
    }

    fn acquire<F>(&self, idle: &Idle, create: F) -> Result<PoolGuard>
    where
        F: FnOnce() -> Result<Box<dyn Coder>>,
    {
        let pooled = idle.lock().pop();
        let coder = match pooled {
            Some(coder) => coder,
            None => create()?,
        };
        Ok(PoolGuard {
            coder: Some(coder),
            home: idle.clone(),
            max_idle: self.max_idle,
        })
    }

    pub fn acquire_encoder(&self) -> Result<PoolGuard> {
        self.acquire(&self.encoders, || self.inner.encoder())
    }

    pub fn acquire_decoder(&self) -> Result<PoolGuard> {
        self.acquire(&self.decoders, || self.inner.decoder())
    }
}

impl<T: Transform> Transform for Pooled<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn encoder(&self) -> Result<Box<dyn Coder>> {
        Ok(Box::new(self.acquire_encoder()?))
    }

    fn decoder(&self) -> Result<Box<dyn Coder>> {
        Ok(Box::new(self.acquire_decoder()?))
    }
}

/// A borrowed coder that returns to its pool on drop
pub struct PoolGuard {
    coder: Option<Box<dyn Coder>>,
    home: Idle,
    max_idle: usize,
}

impl Coder for PoolGuard {
    fn code(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.coder.as_mut() {
            Some(coder) => coder.code(data),
            None => Ok(data),
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(coder) = self.coder.take() {
            let mut idle = self.home.lock();
            if idle.len() < self.max_idle {
                idle.push(coder);
            }
        }
    }
}
