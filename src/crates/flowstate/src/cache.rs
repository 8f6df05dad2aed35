//! Time-budgeted cached values
//!
//! A [`Cached`] holds a value loaded from some external resource together
//! with the resource's modification stamp. The resource is only probed again
//! once the check budget has elapsed, and only reloaded if its stamp moved.
//! Every reload bumps the epoch, which lets callers tell generations apart.

use crate::error::Result;
use std::time::{Duration, Instant, SystemTime};

/// A value cached from a resource with a modification stamp
#[derive(Debug, Clone)]
pub struct Cached<T> {
    value: Option<T>,
    stamp: Option<SystemTime>,
    last_checked: Option<Instant>,
    epoch: u64,
}

impl<T: Clone> Cached<T> {
    pub fn new() -> Self {
        Self {
            value: None,
            stamp: None,
            last_checked: None,
            epoch: 0,
        }
    }

    /// Number of loads so far
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Return the cached value, revalidating it against the resource if the
    /// last check is older than `budget`
    ///
    /// `probe` returns the resource's current stamp, or `None` if the
    /// resource is gone. `load` is called only when there is no value yet or
    /// the stamp changed.
    pub fn get_or_refresh<P, L>(&mut self, budget: Duration, probe: P, load: L) -> Result<Option<T>>
    where
        P: FnOnce() -> Result<Option<SystemTime>>,
        L: FnOnce() -> Result<T>,
    {
        let now = Instant::now();
        if let (Some(value), Some(checked)) = (&self.value, self.last_checked) {
            if now.duration_since(checked) < budget {
                return Ok(Some(value.clone()));
            }
        }

        let Some(stamp) = probe()? else {
            if self.value.take().is_some() {
                self.epoch += 1;
            }
            self.stamp = None;
            self.last_checked = None;
            return Ok(None);
        };

        if self.value.is_none() || self.stamp != Some(stamp) {
            self.value = Some(load()?);
            self.stamp = Some(stamp);
            self.epoch += 1;
        }
        self.last_checked = Some(now);
        Ok(self.value.clone())
    }

    /// Drop the cached value so the next access reloads
    pub fn invalidate(&mut self) {
        self.last_checked = None;
        self.stamp = None;
    }
}

impl<T: Clone> Default for Cached<T> {
    fn default() -> Self {
        Self::new()
    }
}
