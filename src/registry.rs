//! Process-local registry of outbound buffers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use uuid::Uuid;

use crate::buffer::{BufferWrapper, ReadSeek, lock};

/// Mapping from buffer id to wrapper, guarded by a single mutex.
///
/// The mutex covers only the lookup/insert/remove windows; callers clone the
/// `Arc` out and serialize source access on the wrapper's own lock, so the
/// registry is never held across I/O or network waits.
pub struct BufferRegistry {
    wrappers: Mutex<HashMap<String, Arc<BufferWrapper>>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self {
            wrappers: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh unique id and register `source` under it.
    ///
    /// Minting and insertion happen under one lock hold, so a minted id can
    /// never collide with a concurrently registered buffer.
    pub fn register(&self, source: Box<dyn ReadSeek>) -> Arc<BufferWrapper> {
        let mut wrappers = lock(&self.wrappers);

        // Collisions are astronomically unlikely; the loop is defensive.
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !wrappers.contains_key(&candidate) {
                break candidate;
            }
            debug!("buffer id collision on {candidate}, reminting");
        };

        let wrapper = Arc::new(BufferWrapper::new(id.clone(), source));
        wrappers.insert(id, Arc::clone(&wrapper));
        wrapper
    }

    pub fn find(&self, id: &str) -> Option<Arc<BufferWrapper>> {
        lock(&self.wrappers).get(id).cloned()
    }

    /// Remove a buffer.  Idempotent: removing an absent id is a no-op, which
    /// keeps cleanup-after-error paths simple.
    pub fn remove(&self, id: &str) {
        lock(&self.wrappers).remove(id);
    }

    pub fn clear(&self) {
        lock(&self.wrappers).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.wrappers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.wrappers).is_empty()
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
