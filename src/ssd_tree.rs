// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    binary_search::partition_point,
    block_allocator::BlockAllocator,
    file::BlockFile,
    superleaf::{LeafInsert, SuperLeaf},
};
use std::{
    path::Path,
    sync::{Mutex, RwLock},
};

/// Default fanout of internal nodes
pub const DEFAULT_SSD_ORDER: usize = 64;

struct InternalNode {
    keys: Vec<u32>,
    children: Vec<usize>,

    /// Whether the children are super-leaves
    leaf_parent: bool,
}

enum Node {
    Internal(InternalNode),
    Leaf(SuperLeaf),
}

struct TreeCore {
    nodes: Vec<Node>,
    root: usize,
}

enum InsertStep {
    /// The pair landed in a super-leaf
    Done,

    /// A split was wired in along the path; descend again
    Retry,

    /// The child split and promotes a separator to the caller
    Split { key: u32, right: usize },
}

/// B+tree over the SSD block file.
///
/// Internal nodes are DRAM-resident; leaves are [`SuperLeaf`]s whose
/// sub-pages live in 4 KiB blocks. Separator keys route equal fingerprints
/// to the right child, matching the split contract (the right sibling holds
/// everything greater or equal to the promoted median).
pub struct SsdTree {
    core: RwLock<TreeCore>,
    dev: BlockFile,
    alloc: Mutex<BlockAllocator>,
    order: usize,
}

impl SsdTree {
    /// Opens the tree over the block file at `path`, growing the file to
    /// `total_blocks` 4 KiB blocks if needed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the geometry is invalid.
    pub fn open(path: &Path, total_blocks: u32, order: usize) -> crate::Result<Self> {
        if order < 2 {
            return Err(crate::Error::InvalidConfig("ssd_order must be at least 2"));
        }
        if total_blocks == 0 {
            return Err(crate::Error::InvalidConfig("total_blocks must be non-zero"));
        }

        log::debug!("Opening SSD tree at {path:?} with {total_blocks} blocks");

        let dev = BlockFile::open(path, total_blocks)?;

        Ok(Self {
            core: RwLock::new(TreeCore {
                nodes: vec![Node::Leaf(SuperLeaf::new())],
                root: 0,
            }),
            dev,
            alloc: Mutex::new(BlockAllocator::new(total_blocks)),
            order,
        })
    }

    /// Inserts or updates a pair, splitting super-leaves and internal
    /// nodes as needed. The root grows when it splits.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, blocks run out, or a
    /// sub-page overflows below the split watermark.
    pub fn insert(&self, fp: u32, value: u64) -> crate::Result<()> {
        let mut core = self.core.write().expect("lock is poisoned");

        loop {
            let root = core.root;

            match Self::insert_step(&mut core, &self.dev, &self.alloc, self.order, root, fp, value)?
            {
                InsertStep::Done => return Ok(()),
                InsertStep::Retry => {}
                InsertStep::Split { key, right } => {
                    let leaf_parent = matches!(core.nodes.get(core.root), Some(Node::Leaf(_)));
                    let old_root = core.root;

                    core.nodes.push(Node::Internal(InternalNode {
                        keys: vec![key],
                        children: vec![old_root, right],
                        leaf_parent,
                    }));
                    core.root = core.nodes.len() - 1;

                    log::debug!("SSD tree root split, separator {key}");
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn insert_step(
        core: &mut TreeCore,
        dev: &BlockFile,
        alloc: &Mutex<BlockAllocator>,
        order: usize,
        node_id: usize,
        fp: u32,
        value: u64,
    ) -> crate::Result<InsertStep> {
        let child_id = match core.nodes.get(node_id) {
            Some(Node::Internal(node)) => {
                let pos = partition_point(&node.keys, |&k| k <= fp);
                Some(*node.children.get(pos).expect("separator must have children"))
            }
            Some(Node::Leaf(_)) => None,
            None => unreachable!("node id out of bounds"),
        };

        let Some(child_id) = child_id else {
            // Super-leaf: insert, splitting at the watermark
            let right_id = core.nodes.len();

            let split = {
                let Some(Node::Leaf(leaf)) = core.nodes.get_mut(node_id) else {
                    unreachable!("node must be a leaf");
                };

                match leaf.insert(dev, alloc, fp, value)? {
                    LeafInsert::Inserted | LeafInsert::Updated(_) => None,
                    LeafInsert::NeedsSplit => {
                        let (median, mut right) = leaf.split(dev, alloc)?;

                        let old_next = leaf.next;
                        right.prev = Some(node_id);
                        right.next = old_next;
                        leaf.next = Some(right_id);

                        Some((median, right, old_next))
                    }
                }
            };

            let Some((median, right, old_next)) = split else {
                return Ok(InsertStep::Done);
            };

            core.nodes.push(Node::Leaf(right));

            if let Some(Node::Leaf(neighbour)) = old_next.and_then(|id| core.nodes.get_mut(id)) {
                neighbour.prev = Some(right_id);
            }

            return Ok(InsertStep::Split {
                key: median,
                right: right_id,
            });
        };

        match Self::insert_step(core, dev, alloc, order, child_id, fp, value)? {
            step @ (InsertStep::Done | InsertStep::Retry) => Ok(step),

            InsertStep::Split { key, right } => {
                let Some(Node::Internal(node)) = core.nodes.get_mut(node_id) else {
                    unreachable!("parent must be an internal node");
                };

                let pos = partition_point(&node.keys, |&k| k < key);
                node.keys.insert(pos, key);
                node.children.insert(pos + 1, right);

                if node.children.len() <= order {
                    return Ok(InsertStep::Retry);
                }

                // Split this internal node as well
                let mid = node.keys.len() / 2;
                let right_keys = node.keys.split_off(mid + 1);
                let up = node.keys.pop().expect("internal node must have keys");
                let right_children = node.children.split_off(mid + 1);
                let leaf_parent = node.leaf_parent;

                core.nodes.push(Node::Internal(InternalNode {
                    keys: right_keys,
                    children: right_children,
                    leaf_parent,
                }));

                log::trace!("Internal node split, separator {up}");

                Ok(InsertStep::Split {
                    key: up,
                    right: core.nodes.len() - 1,
                })
            }
        }
    }

    /// Looks up a fingerprint.
    ///
    /// Descends the DRAM-resident internal nodes, then touches at most one
    /// 4 KiB block of the target super-leaf.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get(&self, fp: u32) -> crate::Result<Option<u64>> {
        let core = self.core.read().expect("lock is poisoned");
        let mut id = core.root;

        loop {
            match core.nodes.get(id) {
                Some(Node::Internal(node)) => {
                    let pos = partition_point(&node.keys, |&k| k <= fp);
                    id = *node.children.get(pos).expect("separator must have children");
                }
                Some(Node::Leaf(leaf)) => return leaf.search(&self.dev, fp),
                None => unreachable!("node id out of bounds"),
            }
        }
    }

    /// Removes a fingerprint, returning its value.
    ///
    /// Super-leaves are not rebalanced on removal.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn remove(&self, fp: u32) -> crate::Result<Option<u64>> {
        let mut core = self.core.write().expect("lock is poisoned");
        let mut id = core.root;

        loop {
            match core.nodes.get(id) {
                Some(Node::Internal(node)) => {
                    let pos = partition_point(&node.keys, |&k| k <= fp);
                    id = *node.children.get(pos).expect("separator must have children");
                }
                Some(Node::Leaf(_)) => break,
                None => unreachable!("node id out of bounds"),
            }
        }

        match core.nodes.get_mut(id) {
            Some(Node::Leaf(leaf)) => leaf.delete(&self.dev, fp),
            _ => unreachable!("descent must end at a leaf"),
        }
    }

    /// Writes every dirty sub-page back and syncs the file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&self) -> crate::Result<()> {
        let mut core = self.core.write().expect("lock is poisoned");

        for node in &mut core.nodes {
            if let Node::Leaf(leaf) = node {
                leaf.flush_dirty(&self.dev)?;
            }
        }

        self.dev.sync()
    }

    /// Number of pairs in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        let core = self.core.read().expect("lock is poisoned");

        core.nodes
            .iter()
            .map(|node| match node {
                Node::Leaf(leaf) => leaf.total_entries(),
                Node::Internal(_) => 0,
            })
            .sum()
    }

    /// Whether the tree holds no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Height of the tree (a lone super-leaf has height 1).
    #[doc(hidden)]
    #[must_use]
    pub fn height(&self) -> usize {
        let core = self.core.read().expect("lock is poisoned");
        let mut id = core.root;
        let mut height = 1;

        loop {
            match core.nodes.get(id) {
                Some(Node::Internal(node)) => {
                    height += 1;
                    id = *node.children.first().expect("node must have children");
                }
                _ => return height,
            }
        }
    }

    /// Entry counts of all super-leaves.
    #[doc(hidden)]
    #[must_use]
    pub fn leaf_entry_counts(&self) -> Vec<usize> {
        let core = self.core.read().expect("lock is poisoned");

        core.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Leaf(leaf) => Some(leaf.total_entries()),
                Node::Internal(_) => None,
            })
            .collect()
    }

    /// Separator keys stored in leaf-parent nodes.
    #[doc(hidden)]
    #[must_use]
    pub fn leaf_parent_separators(&self) -> Vec<u32> {
        let core = self.core.read().expect("lock is poisoned");
        let mut out = Vec::new();

        for node in &core.nodes {
            if let Node::Internal(n) = node {
                if n.leaf_parent {
                    out.extend_from_slice(&n.keys);
                }
            }
        }

        out
    }

    /// Checks that every pair sits in the sub-page slot its fingerprint
    /// hashes to.
    #[doc(hidden)]
    pub fn verify_slot_routing(&self) -> crate::Result<bool> {
        use crate::{fingerprint::sub_page_slot, superleaf::SUB_PAGES_PER_LEAF};

        let core = self.core.read().expect("lock is poisoned");

        for node in &core.nodes {
            let Node::Leaf(leaf) = node else {
                continue;
            };

            for slot in 0..SUB_PAGES_PER_LEAF {
                for (fp, _) in leaf.slot_pairs(&self.dev, slot)? {
                    if sub_page_slot(fp, SUB_PAGES_PER_LEAF) != slot {
                        return Ok(false);
                    }
                }
            }
        }

        Ok(true)
    }

    /// Checks that the leaf sibling chain is wired consistently: one head,
    /// back pointers matching forward pointers, every leaf on the chain.
    #[doc(hidden)]
    #[must_use]
    pub fn verify_sibling_links(&self) -> bool {
        let core = self.core.read().expect("lock is poisoned");

        let leaf_count = core
            .nodes
            .iter()
            .filter(|node| matches!(node, Node::Leaf(_)))
            .count();

        let mut head = None;

        for (id, node) in core.nodes.iter().enumerate() {
            if let Node::Leaf(leaf) = node {
                if leaf.prev.is_none() {
                    if head.is_some() {
                        return false;
                    }
                    head = Some(id);
                }
            }
        }

        let Some(mut id) = head else {
            return leaf_count == 0;
        };

        let mut visited = 1;

        loop {
            let Some(Node::Leaf(leaf)) = core.nodes.get(id) else {
                return false;
            };

            let Some(next) = leaf.next else {
                break;
            };

            match core.nodes.get(next) {
                Some(Node::Leaf(neighbour)) if neighbour.prev == Some(id) => {}
                _ => return false,
            }

            id = next;
            visited += 1;
        }

        visited == leaf_count
    }

    /// Checks that no block is referenced twice and that every referenced
    /// block is marked allocated.
    #[doc(hidden)]
    pub fn verify_block_integrity(&self) -> crate::Result<bool> {
        let core = self.core.read().expect("lock is poisoned");
        let alloc = self.alloc.lock().expect("lock is poisoned");
        let mut seen = std::collections::BTreeSet::new();

        for node in &core.nodes {
            let Node::Leaf(leaf) = node else {
                continue;
            };

            for id in leaf.block_ids() {
                if !seen.insert(id) || !alloc.is_allocated(id) {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open_tree(order: usize) -> crate::Result<(tempfile::TempDir, SsdTree)> {
        let dir = tempfile::tempdir()?;
        let tree = SsdTree::open(&dir.path().join("tree.ssd"), 4_096, order)?;
        Ok((dir, tree))
    }

    #[test]
    fn ssd_tree_point_ops() -> crate::Result<()> {
        let (_dir, tree) = open_tree(DEFAULT_SSD_ORDER)?;

        for fp in 1u32..=1_000 {
            tree.insert(fp, u64::from(fp) * 3)?;
        }

        assert_eq!(1_000, tree.len());

        for fp in 1u32..=1_000 {
            assert_eq!(Some(u64::from(fp) * 3), tree.get(fp)?);
        }
        assert_eq!(None, tree.get(1_001)?);

        assert_eq!(Some(300), tree.remove(100)?);
        assert_eq!(None, tree.remove(100)?);
        assert_eq!(None, tree.get(100)?);
        assert_eq!(999, tree.len());

        Ok(())
    }

    #[test]
    fn ssd_tree_upsert() -> crate::Result<()> {
        let (_dir, tree) = open_tree(DEFAULT_SSD_ORDER)?;

        tree.insert(42, 1)?;
        tree.insert(42, 2)?;

        assert_eq!(1, tree.len());
        assert_eq!(Some(2), tree.get(42)?);

        Ok(())
    }

    #[test]
    fn ssd_tree_leaf_splits() -> crate::Result<()> {
        let (_dir, tree) = open_tree(DEFAULT_SSD_ORDER)?;
        let count = 20_000u32;

        for fp in 1..=count {
            tree.insert(fp, u64::from(fp))?;
        }

        assert_eq!(count as usize, tree.len());
        assert!(tree.leaf_entry_counts().len() > 1);
        assert!(!tree.leaf_parent_separators().is_empty());

        for fp in 1..=count {
            assert_eq!(Some(u64::from(fp)), tree.get(fp)?);
        }

        assert!(tree.verify_slot_routing()?);
        assert!(tree.verify_block_integrity()?);
        assert!(tree.verify_sibling_links());

        Ok(())
    }

    #[test]
    fn ssd_tree_root_grows_past_leaf_parent() -> crate::Result<()> {
        // A tiny fanout forces internal splits well above the leaf-parent
        let (_dir, tree) = open_tree(3)?;
        let count = 60_000u32;

        for fp in (1..=count).rev() {
            tree.insert(fp, u64::from(fp) + 7)?;
        }

        assert!(tree.height() > 3, "height was {}", tree.height());
        assert_eq!(count as usize, tree.len());

        for fp in 1..=count {
            assert_eq!(Some(u64::from(fp) + 7), tree.get(fp)?);
        }

        assert!(tree.verify_block_integrity()?);
        assert!(tree.verify_sibling_links());

        Ok(())
    }

    #[test]
    fn ssd_tree_flush_and_reread() -> crate::Result<()> {
        let (_dir, tree) = open_tree(DEFAULT_SSD_ORDER)?;

        for fp in 1u32..=6_000 {
            tree.insert(fp, u64::from(fp))?;
        }

        tree.flush()?;

        for fp in 1u32..=6_000 {
            assert_eq!(Some(u64::from(fp)), tree.get(fp)?);
        }

        Ok(())
    }
}
