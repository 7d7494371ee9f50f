//! Time-windowed set of recently moved blocks.
//!
//! A block that was moved (or had a move attempted) stays in the window for
//! the configured width, during which no selector will pick it again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::service::BlockId;

/// Rolling dedup window over moved block ids.
#[derive(Debug)]
pub struct MovedBlocks {
    win_width: Duration,
    entries: HashMap<BlockId, Instant>,
}

impl MovedBlocks {
    pub fn new(win_width: Duration) -> Self {
        Self {
            win_width,
            entries: HashMap::new(),
        }
    }

    /// Record a move attempt for the block.
    pub fn put(&mut self, id: BlockId) {
        self.entries.insert(id, Instant::now());
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    /// Drop entries older than the window width.
    pub fn cleanup(&mut self) {
        let cutoff = Instant::now();
        let width = self.win_width;
        self.entries
            .retain(|_, moved_at| cutoff.duration_since(*moved_at) <= width);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
