use crate::kernel::memory::align_down;
use std::collections::HashSet;

/// Ordered, deduplicated set of block-aligned addresses a block touched.
///
/// Addresses are aligned on the way in; the first observation of a block
/// fixes its position in the result.
#[derive(Debug, Clone)]
pub struct AddressTracker {
    block_size: u64,
    order: Vec<u64>,
    seen: HashSet<u64>,
}

impl AddressTracker {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            order: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Block containing `addr`.
    pub fn block_of(&self, addr: u64) -> u64 {
        align_down(addr, self.block_size)
    }

    /// Record an access; returns `true` if its block was new.
    pub fn record(&mut self, addr: u64) -> bool {
        let block = self.block_of(addr);
        if self.seen.insert(block) {
            self.order.push(block);
            true
        } else {
            false
        }
    }

    /// Whether the block containing `addr` was already recorded.
    pub fn contains(&self, addr: u64) -> bool {
        self.seen.contains(&self.block_of(addr))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn blocks(&self) -> &[u64] {
        &self.order
    }

    pub fn into_blocks(self) -> Vec<u64> {
        self.order
    }
}
