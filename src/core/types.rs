use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Half-open address range `[start, start + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub len: u64,
}

impl BlockRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Exclusive end, clamped to `u64::MAX` for ranges that would wrap.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    /// Exclusive end, or `None` if the range wraps the address space.
    pub fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.len)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Placement of everything the Launcher created inside the isolated context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLayout {
    /// Address of the first instruction of the block
    pub code_location: u64,
    /// Length of the caller's block in bytes
    pub code_len: u64,
    /// Whole read+execute code region (block, sentinel, syscall stub)
    pub code_region: BlockRange,
    /// Initial Guarded Region
    pub guard_region: BlockRange,
    /// Grant and reporting granularity
    pub block_size: u64,
}

impl SandboxLayout {
    /// Address of the completion sentinel.
    pub fn sentinel_addr(&self) -> u64 {
        self.code_location + self.code_len
    }

    /// Address of the tracer's syscall stub, directly after the sentinel.
    pub fn stub_addr(&self) -> u64 {
        self.sentinel_addr() + crate::arch::SENTINEL.len() as u64
    }
}

/// Caller-held handle that aborts pending discovery calls.
///
/// Clones share one flag. Once cancelled a token stays cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_range_bounds() {
        let range = BlockRange::new(0x10000, 0x1000);
        assert!(range.contains(0x10000));
        assert!(range.contains(0x10fff));
        assert!(!range.contains(0x11000));
        assert!(range.overlaps(&BlockRange::new(0x10800, 0x1000)));
        assert!(!range.overlaps(&BlockRange::new(0x11000, 0x1000)));
    }

    #[test]
    fn test_wrapping_range_has_no_checked_end() {
        let range = BlockRange::new(0xffff_ffff_ffff_f000, 0x2000);
        assert_eq!(range.checked_end(), None);
        assert_eq!(range.end(), u64::MAX);
        assert!(range.contains(0xffff_ffff_ffff_f800));
        assert_eq!(BlockRange::new(0x1000, 0x1000).checked_end(), Some(0x2000));
    }

    #[test]
    fn test_layout_places_stub_after_sentinel() {
        let layout = SandboxLayout {
            code_location: 0x2000_0000_0000,
            code_len: 7,
            code_region: BlockRange::new(0x2000_0000_0000, 0x1000),
            guard_region: BlockRange::new(0x10000, 0x1000),
            block_size: 0x1000,
        };
        assert_eq!(layout.sentinel_addr(), 0x2000_0000_0007);
        assert_eq!(layout.stub_addr(), 0x2000_0000_0008);
    }

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
