// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block_allocator::{BlockAllocator, BlockId, INVALID_BLOCK},
    file::{BlockFile, BLOCK_SIZE},
    fingerprint::sub_page_slot,
    subpage::{SubPage, SubPageInsert, SUB_PAGE_CAP},
};
use std::sync::Mutex;

/// Number of sub-page slots per super-leaf
pub const SUB_PAGES_PER_LEAF: usize = 16;

/// Entry count at which a super-leaf becomes eligible for splitting
/// (90 % of total capacity)
pub const SPLIT_WATERMARK: usize = (SUB_PAGES_PER_LEAF * SUB_PAGE_CAP * 9).div_ceil(10);

/// Outcome of [`SuperLeaf::insert`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LeafInsert {
    /// A new pair was added
    Inserted,

    /// The fingerprint already existed; holds the replaced value
    Updated(u64),

    /// The target sub-page is full and the super-leaf is past the split
    /// watermark; nothing was changed
    NeedsSplit,
}

/// A leaf of the SSD B+tree: 16 sub-page slots sharing one key range.
///
/// Sub-pages are lazily loaded from their 4 KiB blocks and written back
/// slot-by-slot, so a point operation touches at most one block.
pub struct SuperLeaf {
    blocks: [BlockId; SUB_PAGES_PER_LEAF],
    cache: [Option<Box<SubPage>>; SUB_PAGES_PER_LEAF],
    dirty: [bool; SUB_PAGES_PER_LEAF],
    total_entries: usize,

    /// Right neighbour in scan order (arena index)
    pub(crate) next: Option<usize>,

    /// Left neighbour in scan order (arena index)
    pub(crate) prev: Option<usize>,
}

impl Default for SuperLeaf {
    fn default() -> Self {
        Self::new()
    }
}

impl SuperLeaf {
    /// Creates an empty super-leaf with no allocated blocks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: [INVALID_BLOCK; SUB_PAGES_PER_LEAF],
            cache: std::array::from_fn(|_| None),
            dirty: [false; SUB_PAGES_PER_LEAF],
            total_entries: 0,
            next: None,
            prev: None,
        }
    }

    /// Number of pairs across all sub-pages.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    /// Number of slots backed by a block.
    #[must_use]
    pub fn active_sub_pages(&self) -> usize {
        self.blocks.iter().filter(|&&id| id != INVALID_BLOCK).count()
    }

    /// Whether the super-leaf is past the split watermark.
    #[must_use]
    pub fn is_split_due(&self) -> bool {
        self.total_entries >= SPLIT_WATERMARK
    }

    /// Block IDs currently referenced by this super-leaf.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().copied().filter(|&id| id != INVALID_BLOCK)
    }

    fn load_slot(&mut self, dev: &BlockFile, slot: usize) -> crate::Result<&mut SubPage> {
        if self.cache[slot].is_none() {
            let mut buf = [0u8; BLOCK_SIZE];
            dev.read_block(self.blocks[slot], &mut buf)?;
            self.cache[slot] = Some(SubPage::read_from(&buf)?);
        }

        Ok(self.cache[slot].as_mut().expect("slot was just loaded"))
    }

    /// Inserts a pair into its hashed sub-page.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LeafOverflow`] if the target sub-page is full
    /// while the super-leaf is still below the split watermark, and
    /// [`crate::Error::SpaceExhausted`] if a fresh slot cannot get a block.
    pub fn insert(
        &mut self,
        dev: &BlockFile,
        alloc: &Mutex<BlockAllocator>,
        fp: u32,
        value: u64,
    ) -> crate::Result<LeafInsert> {
        let slot = sub_page_slot(fp, SUB_PAGES_PER_LEAF);

        if self.blocks[slot] == INVALID_BLOCK {
            let id = alloc
                .lock()
                .expect("lock is poisoned")
                .allocate()
                .ok_or(crate::Error::SpaceExhausted)?;

            log::trace!("Assigned block {id} to sub-page slot {slot}");

            self.blocks[slot] = id;
            self.cache[slot] = Some(SubPage::new());
            self.dirty[slot] = true;
        }

        let split_due = self.is_split_due();
        let page = self.load_slot(dev, slot)?;

        match page.insert(fp, value) {
            SubPageInsert::Inserted => {
                self.total_entries += 1;
                self.dirty[slot] = true;
                Ok(LeafInsert::Inserted)
            }
            SubPageInsert::Updated(old) => {
                self.dirty[slot] = true;
                Ok(LeafInsert::Updated(old))
            }
            SubPageInsert::Full => {
                if split_due {
                    Ok(LeafInsert::NeedsSplit)
                } else {
                    Err(crate::Error::LeafOverflow)
                }
            }
        }
    }

    /// Looks up a fingerprint, touching at most one 4 KiB block.
    ///
    /// The read path does not populate the slot cache, so lookups can run
    /// under a shared lock.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn search(&self, dev: &BlockFile, fp: u32) -> crate::Result<Option<u64>> {
        let slot = sub_page_slot(fp, SUB_PAGES_PER_LEAF);

        if self.blocks[slot] == INVALID_BLOCK {
            return Ok(None);
        }

        if let Some(page) = &self.cache[slot] {
            return Ok(page.search(fp));
        }

        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(self.blocks[slot], &mut buf)?;

        Ok(SubPage::read_from(&buf)?.search(fp))
    }

    /// Removes a fingerprint from its hashed sub-page.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn delete(&mut self, dev: &BlockFile, fp: u32) -> crate::Result<Option<u64>> {
        let slot = sub_page_slot(fp, SUB_PAGES_PER_LEAF);

        if self.blocks[slot] == INVALID_BLOCK {
            return Ok(None);
        }

        let page = self.load_slot(dev, slot)?;
        let old = page.delete(fp);

        if old.is_some() {
            self.total_entries -= 1;
            self.dirty[slot] = true;
        }

        Ok(old)
    }

    /// Writes every dirty sub-page back to its block.
    ///
    /// Each write covers exactly 4 KiB with a zeroed tail.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush_dirty(&mut self, dev: &BlockFile) -> crate::Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];

        for slot in 0..SUB_PAGES_PER_LEAF {
            if !self.dirty[slot] {
                continue;
            }

            let page = self.cache[slot]
                .as_ref()
                .expect("dirty slot must be cached");

            page.write_to(&mut buf);
            dev.write_block(self.blocks[slot], &buf)?;
            self.dirty[slot] = false;
        }

        Ok(())
    }

    /// Collects every pair of the super-leaf, loading missing sub-pages.
    fn collect_pairs(&mut self, dev: &BlockFile) -> crate::Result<Vec<(u32, u64)>> {
        let mut pairs = Vec::with_capacity(self.total_entries);

        for slot in 0..SUB_PAGES_PER_LEAF {
            if self.blocks[slot] == INVALID_BLOCK {
                continue;
            }

            let page = self.load_slot(dev, slot)?;
            pairs.extend(page.iter());
        }

        Ok(pairs)
    }

    /// Pairs stored in one sub-page slot, reading from disk if the slot is
    /// not cached.
    #[doc(hidden)]
    pub fn slot_pairs(&self, dev: &BlockFile, slot: usize) -> crate::Result<Vec<(u32, u64)>> {
        if self.blocks[slot] == INVALID_BLOCK {
            return Ok(Vec::new());
        }

        if let Some(page) = &self.cache[slot] {
            return Ok(page.iter().collect());
        }

        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(self.blocks[slot], &mut buf)?;

        Ok(SubPage::read_from(&buf)?.iter().collect())
    }

    /// Splits the super-leaf at its median fingerprint.
    ///
    /// Three phases: read every sub-page into memory, redistribute the
    /// sorted pairs around the median, then allocate and write the new
    /// blocks. The source super-leaf is not mutated before every needed
    /// block has been allocated; a failed allocation rolls itself back and
    /// aborts the split.
    ///
    /// Returns the promoted separator and the right sibling. Keys in the
    /// left (existing) super-leaf stay below the separator, keys in the
    /// right are greater or equal. Sibling links are wired by the owning
    /// tree.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or blocks run out.
    pub fn split(
        &mut self,
        dev: &BlockFile,
        alloc: &Mutex<BlockAllocator>,
    ) -> crate::Result<(u32, SuperLeaf)> {
        // Phase 1: read
        let mut pairs = self.collect_pairs(dev)?;
        pairs.sort_by_key(|&(fp, _)| fp);

        let median = pairs
            .get(pairs.len() / 2)
            .map(|&(fp, _)| fp)
            .expect("split requires a populated super-leaf");

        log::trace!(
            "Splitting super-leaf with {} entries at fingerprint {median}",
            pairs.len(),
        );

        // Phase 2: logical redistribution into fresh sub-pages
        let mut left_pages: [Option<Box<SubPage>>; SUB_PAGES_PER_LEAF] =
            std::array::from_fn(|_| None);
        let mut right_pages: [Option<Box<SubPage>>; SUB_PAGES_PER_LEAF] =
            std::array::from_fn(|_| None);

        let mut left_count = 0;
        let mut right_count = 0;

        for &(fp, value) in &pairs {
            let slot = sub_page_slot(fp, SUB_PAGES_PER_LEAF);

            let (pages, count) = if fp < median {
                (&mut left_pages, &mut left_count)
            } else {
                (&mut right_pages, &mut right_count)
            };

            let page = pages[slot].get_or_insert_with(SubPage::new);

            match page.insert(fp, value) {
                SubPageInsert::Inserted => *count += 1,
                SubPageInsert::Updated(_) => {}
                SubPageInsert::Full => return Err(crate::Error::LeafOverflow),
            }
        }

        // Phase 3: allocate before the first mutation
        let right_slots: Vec<usize> = (0..SUB_PAGES_PER_LEAF)
            .filter(|&slot| right_pages[slot].is_some())
            .collect();

        let right_blocks = alloc
            .lock()
            .expect("lock is poisoned")
            .allocate_many(right_slots.len())
            .ok_or(crate::Error::SpaceExhausted)?;

        let mut right = SuperLeaf::new();

        for (&slot, &block) in right_slots.iter().zip(right_blocks.iter()) {
            right.blocks[slot] = block;
            right.cache[slot] = right_pages[slot].take();
            right.dirty[slot] = true;
        }
        right.total_entries = right_count;

        let mut freed = Vec::new();

        for slot in 0..SUB_PAGES_PER_LEAF {
            self.cache[slot] = left_pages[slot].take();

            if self.cache[slot].is_some() {
                self.dirty[slot] = true;
            } else {
                if self.blocks[slot] != INVALID_BLOCK {
                    freed.push(self.blocks[slot]);
                }
                self.blocks[slot] = INVALID_BLOCK;
                self.dirty[slot] = false;
            }
        }
        self.total_entries = left_count;

        // Write both siblings in parallel
        let (left_result, right_result) = std::thread::scope(|s| {
            let left_task = s.spawn(|| self.flush_dirty(dev));
            let right_task = s.spawn(|| right.flush_dirty(dev));

            (left_task.join(), right_task.join())
        });

        left_result.expect("flush thread panicked")?;
        right_result.expect("flush thread panicked")?;

        alloc.lock().expect("lock is poisoned").free_many(&freed);

        Ok((median, right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn setup(blocks: u32) -> crate::Result<(tempfile::TempDir, BlockFile, Mutex<BlockAllocator>)> {
        let dir = tempfile::tempdir()?;
        let dev = BlockFile::open(&dir.path().join("leaves"), blocks)?;
        let alloc = Mutex::new(BlockAllocator::new(blocks));
        Ok((dir, dev, alloc))
    }

    #[test]
    fn super_leaf_insert_search_delete() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(64)?;
        let mut leaf = SuperLeaf::new();

        for fp in 1u32..=500 {
            assert_eq!(
                LeafInsert::Inserted,
                leaf.insert(&dev, &alloc, fp, u64::from(fp) * 10)?,
            );
        }

        assert_eq!(500, leaf.total_entries());

        for fp in 1u32..=500 {
            assert_eq!(Some(u64::from(fp) * 10), leaf.search(&dev, fp)?);
        }
        assert_eq!(None, leaf.search(&dev, 501)?);

        assert_eq!(Some(420), leaf.delete(&dev, 42)?);
        assert_eq!(None, leaf.delete(&dev, 42)?);
        assert_eq!(None, leaf.search(&dev, 42)?);
        assert_eq!(499, leaf.total_entries());

        Ok(())
    }

    #[test]
    fn super_leaf_upsert() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(64)?;
        let mut leaf = SuperLeaf::new();

        assert_eq!(LeafInsert::Inserted, leaf.insert(&dev, &alloc, 77, 1)?);
        assert_eq!(LeafInsert::Updated(1), leaf.insert(&dev, &alloc, 77, 2)?);
        assert_eq!(1, leaf.total_entries());
        assert_eq!(Some(2), leaf.search(&dev, 77)?);

        Ok(())
    }

    #[test]
    fn super_leaf_lazy_load() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(64)?;
        let mut leaf = SuperLeaf::new();

        for fp in 1u32..=100 {
            leaf.insert(&dev, &alloc, fp, u64::from(fp))?;
        }

        leaf.flush_dirty(&dev)?;

        // Drop the cache; searches must come back from disk
        for slot in &mut leaf.cache {
            *slot = None;
        }

        for fp in 1u32..=100 {
            assert_eq!(Some(u64::from(fp)), leaf.search(&dev, fp)?);
        }

        // Deletes reload the sub-page on demand
        assert_eq!(Some(50), leaf.delete(&dev, 50)?);

        Ok(())
    }

    #[test]
    fn super_leaf_slot_routing() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(64)?;
        let mut leaf = SuperLeaf::new();

        for fp in 1u32..=1_000 {
            leaf.insert(&dev, &alloc, fp, 0)?;
        }

        for slot in 0..SUB_PAGES_PER_LEAF {
            let Some(page) = &leaf.cache[slot] else {
                continue;
            };

            for (fp, _) in page.iter() {
                assert_eq!(slot, sub_page_slot(fp, SUB_PAGES_PER_LEAF));
            }
        }

        Ok(())
    }

    fn fill_to_split(
        dev: &BlockFile,
        alloc: &Mutex<BlockAllocator>,
        leaf: &mut SuperLeaf,
    ) -> crate::Result<u32> {
        let mut fp = 0u32;

        loop {
            fp += 1;

            match leaf.insert(dev, alloc, fp, u64::from(fp))? {
                LeafInsert::NeedsSplit => return Ok(fp),
                LeafInsert::Inserted | LeafInsert::Updated(_) => {}
            }
        }
    }

    #[test]
    fn super_leaf_split_preserves_content() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(256)?;
        let mut leaf = SuperLeaf::new();

        let pending = fill_to_split(&dev, &alloc, &mut leaf)?;
        let before = leaf.total_entries();
        assert!(leaf.is_split_due());

        let (median, mut right) = leaf.split(&dev, &alloc)?;

        // Content is preserved and partitioned around the median
        assert_eq!(before, leaf.total_entries() + right.total_entries());
        assert!(leaf.total_entries() < before / 2 + SUB_PAGES_PER_LEAF);
        assert!(right.total_entries() < before / 2 + SUB_PAGES_PER_LEAF);

        for fp in 1..=before as u32 {
            if fp == pending {
                continue;
            }

            let side = if fp < median { &leaf } else { &right };
            assert_eq!(Some(u64::from(fp)), side.search(&dev, fp)?);
        }

        // The pending insert now fits on its side
        let side = if pending < median { &mut leaf } else { &mut right };
        assert_eq!(
            LeafInsert::Inserted,
            side.insert(&dev, &alloc, pending, u64::from(pending))?,
        );

        Ok(())
    }

    #[test]
    fn super_leaf_split_routing_stable() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(256)?;
        let mut leaf = SuperLeaf::new();

        fill_to_split(&dev, &alloc, &mut leaf)?;
        let (_median, right) = leaf.split(&dev, &alloc)?;

        for side in [&leaf, &right] {
            for slot in 0..SUB_PAGES_PER_LEAF {
                let Some(page) = &side.cache[slot] else {
                    continue;
                };

                for (fp, _) in page.iter() {
                    assert_eq!(slot, sub_page_slot(fp, SUB_PAGES_PER_LEAF));
                }
            }
        }

        Ok(())
    }

    #[test]
    fn super_leaf_split_frees_and_reuses_blocks() -> crate::Result<()> {
        let (_dir, dev, alloc) = setup(256)?;
        let mut leaf = SuperLeaf::new();

        fill_to_split(&dev, &alloc, &mut leaf)?;
        let (_median, right) = leaf.split(&dev, &alloc)?;

        // No block is referenced twice, and every referenced block is
        // marked allocated
        let mut seen = std::collections::BTreeSet::new();
        let guard = alloc.lock().expect("lock is poisoned");

        for id in leaf.block_ids().chain(right.block_ids()) {
            assert!(seen.insert(id), "block {id} referenced twice");
            assert!(guard.is_allocated(id));
        }

        Ok(())
    }

    #[test]
    fn super_leaf_split_allocation_failure_rolls_back() -> crate::Result<()> {
        // Enough blocks to fill the leaf but none to split into
        let (_dir, dev, alloc) = setup(SUB_PAGES_PER_LEAF as u32)?;
        let mut leaf = SuperLeaf::new();

        fill_to_split(&dev, &alloc, &mut leaf)?;
        let before = leaf.total_entries();
        let allocated = alloc.lock().expect("lock is poisoned").allocated();

        assert!(matches!(
            leaf.split(&dev, &alloc),
            Err(crate::Error::SpaceExhausted)
        ));

        // Pre-split state is intact
        assert_eq!(before, leaf.total_entries());
        assert_eq!(
            allocated,
            alloc.lock().expect("lock is poisoned").allocated(),
        );
        assert_eq!(Some(1), leaf.search(&dev, 1)?);

        Ok(())
    }
}
