// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// ID of a 4 KiB block inside the SSD tree file
pub type BlockId = u32;

/// Marks an empty sub-page slot
pub const INVALID_BLOCK: BlockId = BlockId::MAX;

/// Bitmap allocator for the fixed-size blocks of the SSD tree file.
///
/// Purely in-memory bookkeeping; the allocator never does I/O. Callers
/// wrap it in a mutex and must not hold that mutex across I/O.
pub struct BlockAllocator {
    words: Vec<u64>,
    total: u32,
    allocated: u32,

    /// Rotating search hint, points at the block after the last allocation
    hint: u32,
}

impl BlockAllocator {
    /// Creates an allocator over `[0, total_blocks)`.
    #[must_use]
    pub fn new(total_blocks: u32) -> Self {
        let words = vec![0u64; (total_blocks as usize).div_ceil(64)];

        Self {
            words,
            total: total_blocks,
            allocated: 0,
            hint: 0,
        }
    }

    fn test(&self, id: BlockId) -> bool {
        let word = self.words.get(id as usize / 64).copied().unwrap_or(0);
        word & (1 << (id % 64)) != 0
    }

    fn set(&mut self, id: BlockId) {
        if let Some(word) = self.words.get_mut(id as usize / 64) {
            *word |= 1 << (id % 64);
        }
    }

    fn clear(&mut self, id: BlockId) {
        if let Some(word) = self.words.get_mut(id as usize / 64) {
            *word &= !(1 << (id % 64));
        }
    }

    /// Allocates one block, or `None` if the file is full.
    ///
    /// Scans circularly from the rotating hint, so allocation is O(1)
    /// amortized at low occupancy.
    pub fn allocate(&mut self) -> Option<BlockId> {
        if self.allocated == self.total {
            return None;
        }

        let mut id = self.hint % self.total;

        for _ in 0..self.total {
            if !self.test(id) {
                self.set(id);
                self.allocated += 1;
                self.hint = (id + 1) % self.total;
                return Some(id);
            }

            id = (id + 1) % self.total;
        }

        None
    }

    /// Allocates `n` blocks, all or nothing.
    ///
    /// On partial failure every block allocated by this call is freed
    /// again before returning `None`.
    pub fn allocate_many(&mut self, n: usize) -> Option<Vec<BlockId>> {
        let mut ids = Vec::with_capacity(n);

        for _ in 0..n {
            match self.allocate() {
                Some(id) => ids.push(id),
                None => {
                    self.free_many(&ids);
                    return None;
                }
            }
        }

        Some(ids)
    }

    /// Returns a block. Double-free is a no-op.
    pub fn free(&mut self, id: BlockId) {
        if id < self.total && self.test(id) {
            self.clear(id);
            self.allocated -= 1;
        }
    }

    /// Returns several blocks.
    pub fn free_many(&mut self, ids: &[BlockId]) {
        for &id in ids {
            self.free(id);
        }
    }

    /// Whether the block is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, id: BlockId) -> bool {
        id < self.total && self.test(id)
    }

    /// Number of allocated blocks.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Total number of blocks.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn allocator_simple() {
        let mut alloc = BlockAllocator::new(128);

        let a = alloc.allocate().expect("should allocate");
        let b = alloc.allocate().expect("should allocate");
        assert_ne!(a, b);
        assert_eq!(2, alloc.allocated());

        alloc.free(a);
        assert_eq!(1, alloc.allocated());
        assert!(!alloc.is_allocated(a));
        assert!(alloc.is_allocated(b));
    }

    #[test]
    fn allocator_rotates() {
        let mut alloc = BlockAllocator::new(4);

        assert_eq!(Some(0), alloc.allocate());
        assert_eq!(Some(1), alloc.allocate());
        alloc.free(0);

        // The hint keeps rotating instead of reusing 0 immediately
        assert_eq!(Some(2), alloc.allocate());
        assert_eq!(Some(3), alloc.allocate());
        assert_eq!(Some(0), alloc.allocate());
        assert_eq!(None, alloc.allocate());
    }

    #[test]
    fn allocator_double_free_is_noop() {
        let mut alloc = BlockAllocator::new(16);

        let id = alloc.allocate().expect("should allocate");
        alloc.free(id);
        alloc.free(id);
        assert_eq!(0, alloc.allocated());

        // Out-of-range frees are ignored as well
        alloc.free(9_999);
        assert_eq!(0, alloc.allocated());
    }

    #[test]
    fn allocator_exhaustion() {
        let mut alloc = BlockAllocator::new(8);

        for _ in 0..8 {
            assert!(alloc.allocate().is_some());
        }

        assert_eq!(None, alloc.allocate());
    }

    #[test]
    fn allocator_many_rolls_back() {
        let mut alloc = BlockAllocator::new(8);
        let held = alloc.allocate_many(6).expect("should allocate");

        // Only 2 blocks left, the request must fail without leaking them
        assert!(alloc.allocate_many(4).is_none());
        assert_eq!(6, alloc.allocated());

        alloc.free_many(&held);
        assert_eq!(0, alloc.allocated());

        let all = alloc.allocate_many(8).expect("should allocate");
        assert_eq!(8, all.len());
    }
}
