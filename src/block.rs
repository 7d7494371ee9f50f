//! Block arena and moved-block bookkeeping.
//!
//! Every block the balancer has seen lives in one process-wide arena keyed
//! by block id, so a block keeps one identity across listing rounds and
//! iterations. Sources and location lists hold `Arc` back-references into
//! the arena and never own blocks themselves. The arena and the moved-block
//! window share one lock: a selector marks a block moved in the same
//! critical section that qualifies it, which is what keeps two selectors
//! from picking the same block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::model::StorageGroup;
use crate::moved::MovedBlocks;
use crate::service::{BlockId, BlockMeta};

/// A replicated block with its current replica locations. Locations drift
/// between listing rounds; they are back-references and carry no ownership.
#[derive(Debug)]
pub struct BlockRef {
    meta: BlockMeta,
    locations: Mutex<Vec<Arc<StorageGroup>>>,
}

impl BlockRef {
    fn new(meta: BlockMeta) -> Self {
        Self {
            meta,
            locations: Mutex::new(Vec::new()),
        }
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn id(&self) -> &BlockId {
        &self.meta.id
    }

    pub fn num_bytes(&self) -> u64 {
        self.meta.num_bytes
    }

    /// Snapshot of the current replica locations.
    pub fn locations(&self) -> Vec<Arc<StorageGroup>> {
        self.locations.lock().clone()
    }

    /// Replace the location list with a fresh listing.
    pub fn set_locations(&self, locations: Vec<Arc<StorageGroup>>) {
        *self.locations.lock() = locations;
    }

    /// True if some replica of this block lives on the given group.
    pub fn located_on(&self, group: &StorageGroup) -> bool {
        let key = group.key();
        self.locations.lock().iter().any(|l| l.key() == key)
    }
}

struct StoreInner {
    global: HashMap<BlockId, Arc<BlockRef>>,
    moved: MovedBlocks,
}

/// Process-wide block arena plus the moved-block window, under one lock.
pub struct BlockStore {
    inner: Mutex<StoreInner>,
}

impl BlockStore {
    pub fn new(moved_win_width: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                global: HashMap::new(),
                moved: MovedBlocks::new(moved_win_width),
            }),
        }
    }

    /// Look up or create the arena entry for a block. An existing entry has
    /// its locations cleared so the caller can refill them from the new
    /// listing.
    pub fn update_or_insert(&self, meta: BlockMeta) -> Arc<BlockRef> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.global.get(&meta.id) {
            existing.set_locations(Vec::new());
            return existing.clone();
        }
        let block = Arc::new(BlockRef::new(meta));
        inner.global.insert(block.id().clone(), block.clone());
        block
    }

    pub fn contains_moved(&self, id: &BlockId) -> bool {
        self.inner.lock().moved.contains(id)
    }

    /// Atomically qualify and mark a block as moved. `qualify` runs with the
    /// window locked; if it returns true the block enters the window in the
    /// same critical section, so no concurrent selector can pick it.
    ///
    /// Returns false without calling `qualify` if the block is already in
    /// the window. `qualify` must not call back into this store.
    pub fn select_and_mark<F>(&self, id: &BlockId, qualify: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.moved.contains(id) {
            return false;
        }
        if qualify() {
            inner.moved.put(id.clone());
            true
        } else {
            false
        }
    }

    /// Age the moved window and trim the arena to blocks still in it. Runs
    /// between iterations.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.moved.cleanup();
        let StoreInner { global, moved } = &mut *inner;
        global.retain(|id, _| moved.contains(id));
    }

    pub fn global_len(&self) -> usize {
        self.inner.lock().global.len()
    }

    pub fn moved_len(&self) -> usize {
        self.inner.lock().moved.len()
    }
}
