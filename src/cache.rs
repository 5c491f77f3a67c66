use crate::frame::CapturedFrame;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

/// Default number of exception captures kept while waiting for their event.
pub const DEFAULT_CAPACITY: usize = 20;

/// Bounded LRU of captured frames keyed by stack hash.
///
/// Filled by the pause handler, drained by event processing. Both may run on different threads,
/// so access goes through a mutex. Entries are consumed on lookup: a capture enriches at most one
/// outgoing event.
pub struct VariableCache {
    inner: Mutex<LruCache<String, Vec<CapturedFrame>>>,
}

impl Default for VariableCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl VariableCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Vec<CapturedFrame>>> {
        // a panic in another holder cannot leave the cache logically broken, keep using it
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store frames under a hash, evicting the least recently used entry when full.
    pub fn set(&self, hash: String, frames: Vec<CapturedFrame>) {
        self.lock().put(hash, frames);
    }

    /// Return and remove frames stored under a hash.
    pub fn remove(&self, hash: &str) -> Option<Vec<CapturedFrame>> {
        self.lock().pop(hash)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Most recently stored frames, without consuming them.
    pub fn peek_newest(&self) -> Option<Vec<CapturedFrame>> {
        self.lock().iter().next().map(|(_, frames)| frames.clone())
    }
}
