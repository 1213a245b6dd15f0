// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! DRAM tier: a B+tree whose leaves carry per-sub-page compressed images
//! and a write buffer drained by a background flush worker.

mod flush;
mod leaf;
mod meta;
mod write_buffer;

pub use write_buffer::{OpKind, StagedOp};

use crate::{
    binary_search::partition_point, compression::CompressionType, fingerprint::sub_page_slot,
};
use flush::FlushQueue;
use leaf::{
    decode_region, encode_region, region_insert, region_remove, region_search, DramLeaf,
    RegionInsert,
};
use meta::{LeafMeta, MetaArena, SubPageEntry};
use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc, Mutex, MutexGuard, RwLock,
};
use write_buffer::{StageResult, STAGED_OP_BYTES};

/// Marker value noting "the live value for this fingerprint lives in the
/// large-object tier - do not answer from here".
///
/// Interpreted by the tier orchestrator only; the tree stores it like any
/// other value.
pub const TOMBSTONE: u64 = u64::MAX;

const PAIR_BYTES: u64 = (size_of::<u32>() + size_of::<u64>()) as u64;

/// Construction options for [`DramTree`]
#[derive(Clone, Debug)]
pub struct DramOptions {
    /// Internal node fanout
    pub order: usize,

    /// Slots per leaf; must be a multiple of `num_sub_pages`
    pub leaf_entries: usize,

    /// Sub-page regions per leaf
    pub num_sub_pages: usize,

    /// Codec for sub-page images
    pub compression: CompressionType,

    /// Buffered entry count that enqueues a background flush
    pub flush_threshold: usize,

    /// Hard cap of the per-leaf write buffer
    pub buffer_capacity: usize,

    /// Buffered vs synchronous write path
    pub lazy_compression: bool,
}

impl Default for DramOptions {
    fn default() -> Self {
        Self {
            order: 64,
            leaf_entries: 1_024,
            num_sub_pages: 16,
            compression: CompressionType::Lz4,
            flush_threshold: 64,
            buffer_capacity: 256,
            lazy_compression: true,
        }
    }
}

impl DramOptions {
    fn subcap(&self) -> usize {
        self.leaf_entries / self.num_sub_pages
    }

    fn validate(&self) -> crate::Result<()> {
        if self.order < 2 {
            return Err(crate::Error::InvalidConfig("order must be at least 2"));
        }
        if self.num_sub_pages == 0 {
            return Err(crate::Error::InvalidConfig("num_sub_pages must be non-zero"));
        }
        if self.leaf_entries == 0 || self.leaf_entries % self.num_sub_pages != 0 {
            return Err(crate::Error::InvalidConfig(
                "leaf_entries must be a non-zero multiple of num_sub_pages",
            ));
        }
        if self.flush_threshold == 0 || self.flush_threshold > self.buffer_capacity {
            return Err(crate::Error::InvalidConfig(
                "flush_threshold must be in 1..=buffer_capacity",
            ));
        }
        Ok(())
    }
}

enum DramNode {
    Internal { keys: Vec<u32>, children: Vec<usize> },
    Leaf(DramLeaf),
}

struct DramCore {
    nodes: Vec<DramNode>,
    root: usize,

    /// Cursor of the second-chance eviction scan
    clock_hand: usize,
}

#[derive(Default)]
struct Counters {
    resident_bytes: AtomicU64,
    uncompressed_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
    buffered_bytes: AtomicU64,
    live_entries: AtomicU64,
    flush_failures: AtomicU64,
}

type ReclaimFn = Box<dyn Fn(u64) + Send + Sync>;

struct DramShared {
    opts: DramOptions,
    core: RwLock<DramCore>,
    meta: Mutex<MetaArena>,
    codec_lock: Mutex<()>,
    counters: Counters,
    queue: FlushQueue,

    /// Called whenever a committed or staged value is overwritten or
    /// removed, so the owner can release out-of-tree payload storage
    reclaim: Option<ReclaimFn>,
}

#[derive(Copy, Clone)]
struct ApplyResult {
    prior: Option<u64>,
}

enum ApplyStep {
    Done(ApplyResult),
    Retry,
    Split { key: u32, right: usize },
}

impl DramShared {
    fn reclaim_value(&self, value: u64) {
        if let Some(hook) = &self.reclaim {
            hook(value);
        }
    }

    fn codec_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if self.opts.compression.is_thread_safe() {
            None
        } else {
            Some(self.codec_lock.lock().expect("lock is poisoned"))
        }
    }

    fn locate(core: &DramCore, fp: u32) -> usize {
        let mut id = core.root;

        loop {
            match core.nodes.get(id) {
                Some(DramNode::Internal { keys, children }) => {
                    let pos = partition_point(keys, |&k| k <= fp);
                    id = *children.get(pos).expect("separator must have children");
                }
                Some(DramNode::Leaf(_)) => return id,
                None => unreachable!("node id out of bounds"),
            }
        }
    }

    /// Materializes the full slot arrays of a leaf, decompressing if
    /// needed.
    fn ensure_resident(&self, leaf: &mut DramLeaf, m: &mut LeafMeta) -> crate::Result<()> {
        let entries = self.opts.leaf_entries;
        let subcap = self.opts.subcap();

        if m.compressed {
            let mut keys = vec![0u32; entries];
            let mut vals = vec![0u64; entries];

            {
                let _codec = self.codec_guard();

                for slot in 0..self.opts.num_sub_pages {
                    let e = *m.entries.get(slot).expect("compressed leaf must have entries");

                    let image = m
                        .backing
                        .get(e.offset as usize..(e.offset + e.len) as usize)
                        .expect("sub-page image must be in bounds");

                    let raw = self.opts.compression.decompress(image, e.uncompressed as usize)?;
                    let (k, v) = decode_region(&raw, subcap)?;

                    let start = slot * subcap;
                    keys[start..start + subcap].copy_from_slice(&k);
                    vals[start..start + subcap].copy_from_slice(&v);
                }
            }

            let backing_len = m.backing.len() as u64;
            m.compressed = false;
            m.entries.clear();
            m.backing = Vec::new();

            leaf.keys = keys;
            leaf.vals = vals;

            self.counters
                .uncompressed_bytes
                .fetch_sub(entries as u64 * PAIR_BYTES, Relaxed);
            self.counters.compressed_bytes.fetch_sub(backing_len, Relaxed);
            self.counters
                .resident_bytes
                .fetch_add(entries as u64 * PAIR_BYTES, Relaxed);
        } else if !leaf.is_resident() {
            leaf.keys = vec![0; entries];
            leaf.vals = vec![0; entries];

            self.counters
                .resident_bytes
                .fetch_add(entries as u64 * PAIR_BYTES, Relaxed);
        }

        Ok(())
    }

    /// Compresses a resident leaf sub-page by sub-page into its backing
    /// buffer.
    ///
    /// If any sub-page turns out incompressible the leaf stays
    /// uncompressed; the affected metadata entry keeps length 0.
    fn compress_leaf(&self, leaf: &mut DramLeaf, m: &mut LeafMeta) -> crate::Result<()> {
        if m.compressed || !leaf.is_resident() {
            return Ok(());
        }

        // Only the hash-partitioned layout compresses region-wise
        debug_assert!(matches!(m.layout, meta::LeafLayout::Hashed));

        let entries = self.opts.leaf_entries;
        let subcap = self.opts.subcap();
        let max_compressed = entries * PAIR_BYTES as usize;

        let mut scratch = Vec::with_capacity(subcap * PAIR_BYTES as usize);
        let mut backing = Vec::new();
        let mut index = Vec::with_capacity(self.opts.num_sub_pages);
        let mut gave_up = false;

        {
            let _codec = self.codec_guard();

            for slot in 0..self.opts.num_sub_pages {
                let start = slot * subcap;

                encode_region(
                    &leaf.keys[start..start + subcap],
                    &leaf.vals[start..start + subcap],
                    &mut scratch,
                );

                #[allow(clippy::cast_possible_truncation)]
                match self.opts.compression.compress(&scratch) {
                    Some(image) if backing.len() + image.len() <= max_compressed => {
                        index.push(SubPageEntry {
                            offset: backing.len() as u32,
                            len: image.len() as u32,
                            uncompressed: scratch.len() as u32,
                        });
                        backing.extend_from_slice(&image);
                    }
                    _ => {
                        index.push(SubPageEntry {
                            offset: 0,
                            len: 0,
                            uncompressed: scratch.len() as u32,
                        });
                        gave_up = true;
                        break;
                    }
                }
            }
        }

        if gave_up {
            log::trace!("Leaf stays uncompressed, incompressible sub-page");
            m.entries = index;
            m.backing.clear();
            return Ok(());
        }

        self.counters
            .resident_bytes
            .fetch_sub(entries as u64 * PAIR_BYTES, Relaxed);
        self.counters
            .uncompressed_bytes
            .fetch_add(entries as u64 * PAIR_BYTES, Relaxed);
        self.counters
            .compressed_bytes
            .fetch_add(backing.len() as u64, Relaxed);

        m.entries = index;
        m.backing = backing;
        m.compressed = true;

        leaf.keys = Vec::new();
        leaf.vals = Vec::new();

        Ok(())
    }

    /// Splits a resident leaf at its median fingerprint, re-hashing every
    /// pair into its destination sub-page and partitioning the staged
    /// write buffer.
    fn split_leaf(
        &self,
        core: &mut DramCore,
        arena: &mut MetaArena,
        node_id: usize,
    ) -> crate::Result<(u32, usize)> {
        let entries = self.opts.leaf_entries;
        let subcap = self.opts.subcap();

        let (pairs, meta_idx) = {
            let Some(DramNode::Leaf(leaf)) = core.nodes.get_mut(node_id) else {
                unreachable!("node must be a leaf");
            };

            debug_assert!(leaf.is_resident());

            let mut pairs: Vec<(u32, u64)> = leaf
                .keys
                .iter()
                .zip(leaf.vals.iter())
                .filter(|&(&k, _)| k != 0)
                .map(|(&k, &v)| (k, v))
                .collect();

            pairs.sort_by_key(|&(fp, _)| fp);
            (pairs, leaf.meta)
        };

        let median = pairs
            .get(pairs.len() / 2)
            .map(|&(fp, _)| fp)
            .expect("split requires a populated leaf");

        let mut left_keys = vec![0u32; entries];
        let mut left_vals = vec![0u64; entries];
        let mut right_keys = vec![0u32; entries];
        let mut right_vals = vec![0u64; entries];

        for &(fp, value) in &pairs {
            let slot = sub_page_slot(fp, self.opts.num_sub_pages);
            let start = slot * subcap;

            let (keys, vals) = if fp < median {
                (&mut left_keys, &mut left_vals)
            } else {
                (&mut right_keys, &mut right_vals)
            };

            match region_insert(
                &mut keys[start..start + subcap],
                &mut vals[start..start + subcap],
                fp,
                value,
            ) {
                RegionInsert::Inserted => {}
                RegionInsert::Updated(_) | RegionInsert::Full => {
                    unreachable!("regions cannot overflow during redistribution")
                }
            }
        }

        let right_ops = arena.get_mut(meta_idx).buffer.split_off(median);

        let mut right_meta = LeafMeta::new(self.opts.buffer_capacity);
        right_meta.buffer.restore(right_ops);
        let right_meta_idx = arena.insert(right_meta);

        let right_id = core.nodes.len();
        core.nodes.push(DramNode::Leaf(DramLeaf {
            keys: right_keys,
            vals: right_vals,
            meta: right_meta_idx,
            access: std::sync::atomic::AtomicBool::new(false),
        }));

        {
            let Some(DramNode::Leaf(leaf)) = core.nodes.get_mut(node_id) else {
                unreachable!("node must be a leaf");
            };
            leaf.keys = left_keys;
            leaf.vals = left_vals;
        }

        self.counters
            .resident_bytes
            .fetch_add(entries as u64 * PAIR_BYTES, Relaxed);

        {
            let m = arena.get_mut(right_meta_idx);
            if m.buffer.len() >= self.opts.flush_threshold {
                m.enqueued = true;
                self.queue.enqueue(right_id);
            }
        }

        log::trace!("DRAM leaf split at fingerprint {median}");

        Ok((median, right_id))
    }

    fn apply_committed(
        &self,
        core: &mut DramCore,
        arena: &mut MetaArena,
        op: StagedOp,
        touched: &mut Vec<usize>,
    ) -> crate::Result<ApplyResult> {
        loop {
            let root = core.root;

            match self.apply_step(core, arena, root, op, touched)? {
                ApplyStep::Done(result) => return Ok(result),
                ApplyStep::Retry => {}
                ApplyStep::Split { key, right } => {
                    core.nodes.push(DramNode::Internal {
                        keys: vec![key],
                        children: vec![core.root, right],
                    });
                    core.root = core.nodes.len() - 1;

                    log::trace!("DRAM tree root split, separator {key}");
                }
            }
        }
    }

    fn apply_step(
        &self,
        core: &mut DramCore,
        arena: &mut MetaArena,
        node_id: usize,
        op: StagedOp,
        touched: &mut Vec<usize>,
    ) -> crate::Result<ApplyStep> {
        let child_id = match core.nodes.get(node_id) {
            Some(DramNode::Internal { keys, children }) => {
                let pos = partition_point(keys, |&k| k <= op.fp);
                Some(*children.get(pos).expect("separator must have children"))
            }
            Some(DramNode::Leaf(_)) => None,
            None => unreachable!("node id out of bounds"),
        };

        let Some(child_id) = child_id else {
            let subcap = self.opts.subcap();

            {
                let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get_mut(node_id) else {
                    unreachable!("node must be a leaf");
                };
                let m = arena.get_mut(dram_leaf.meta);

                self.ensure_resident(dram_leaf, m)?;

                let slot = sub_page_slot(op.fp, self.opts.num_sub_pages);
                let start = slot * subcap;
                let keys = &mut dram_leaf.keys[start..start + subcap];
                let vals = &mut dram_leaf.vals[start..start + subcap];

                match op.kind {
                    OpKind::Insert => match region_insert(keys, vals, op.fp, op.value) {
                        RegionInsert::Inserted => {
                            self.counters.live_entries.fetch_add(1, Relaxed);
                            touched.push(node_id);
                            return Ok(ApplyStep::Done(ApplyResult { prior: None }));
                        }
                        RegionInsert::Updated(old) => {
                            self.reclaim_value(old);
                            touched.push(node_id);
                            return Ok(ApplyStep::Done(ApplyResult { prior: Some(old) }));
                        }
                        RegionInsert::Full => {}
                    },
                    OpKind::Delete => {
                        let old = region_remove(keys, vals, op.fp);

                        if let Some(old) = old {
                            self.counters.live_entries.fetch_sub(1, Relaxed);
                            self.reclaim_value(old);
                            touched.push(node_id);
                        }

                        return Ok(ApplyStep::Done(ApplyResult { prior: old }));
                    }
                }
            }

            // Target sub-page region is full; split and retry from the top
            let (median, right_id) = self.split_leaf(core, arena, node_id)?;
            touched.push(node_id);
            touched.push(right_id);

            return Ok(ApplyStep::Split {
                key: median,
                right: right_id,
            });
        };

        match self.apply_step(core, arena, child_id, op, touched)? {
            step @ (ApplyStep::Done(_) | ApplyStep::Retry) => Ok(step),

            ApplyStep::Split { key, right } => {
                let split = {
                    let Some(DramNode::Internal { keys, children }) = core.nodes.get_mut(node_id)
                    else {
                        unreachable!("parent must be an internal node");
                    };

                    let pos = partition_point(keys, |&k| k < key);
                    keys.insert(pos, key);
                    children.insert(pos + 1, right);

                    if children.len() <= self.opts.order {
                        None
                    } else {
                        let mid = keys.len() / 2;
                        let right_keys = keys.split_off(mid + 1);
                        let up = keys.pop().expect("internal node must have keys");
                        let right_children = children.split_off(mid + 1);

                        Some((up, right_keys, right_children))
                    }
                };

                let Some((up, right_keys, right_children)) = split else {
                    return Ok(ApplyStep::Retry);
                };

                core.nodes.push(DramNode::Internal {
                    keys: right_keys,
                    children: right_children,
                });

                Ok(ApplyStep::Split {
                    key: up,
                    right: core.nodes.len() - 1,
                })
            }
        }
    }

    /// Applies and clears a leaf's staged operations, then recompresses
    /// every leaf the operations landed in.
    fn flush_leaf(&self, node_id: usize) -> crate::Result<()> {
        let mut core = self.core.write().expect("lock is poisoned");
        let mut arena = self.meta.lock().expect("lock is poisoned");

        let ops = {
            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get(node_id) else {
                return Ok(());
            };

            let m = arena.get_mut(dram_leaf.meta);
            m.enqueued = false;
            m.buffer.take()
        };

        if ops.is_empty() {
            return Ok(());
        }

        log::trace!("Flushing {} staged ops of leaf {node_id}", ops.len());

        self.counters
            .buffered_bytes
            .fetch_sub(ops.len() as u64 * STAGED_OP_BYTES, Relaxed);

        let mut touched = Vec::new();

        for op in ops {
            self.apply_committed(&mut core, &mut arena, op, &mut touched)?;
        }

        touched.sort_unstable();
        touched.dedup();

        for id in touched {
            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get_mut(id) else {
                continue;
            };

            let m = arena.get_mut(dram_leaf.meta);
            self.compress_leaf(dram_leaf, m)?;
        }

        Ok(())
    }

    fn upsert_sync(&self, fp: u32, value: u64) -> crate::Result<()> {
        let mut core = self.core.write().expect("lock is poisoned");
        let mut arena = self.meta.lock().expect("lock is poisoned");

        let node_id = Self::locate(&core, fp);

        let staged = {
            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get(node_id) else {
                unreachable!("descent must end at a leaf");
            };
            arena.get_mut(dram_leaf.meta).buffer.remove_key(fp)
        };

        if let Some(op) = staged {
            self.counters.buffered_bytes.fetch_sub(STAGED_OP_BYTES, Relaxed);

            if op.kind == OpKind::Insert {
                self.reclaim_value(op.value);
            }
        }

        let mut touched = Vec::new();
        self.apply_committed(
            &mut core,
            &mut arena,
            StagedOp {
                fp,
                value,
                kind: OpKind::Insert,
            },
            &mut touched,
        )?;

        touched.sort_unstable();
        touched.dedup();

        for id in touched {
            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get_mut(id) else {
                continue;
            };

            let m = arena.get_mut(dram_leaf.meta);
            self.compress_leaf(dram_leaf, m)?;
        }

        Ok(())
    }

    fn remove_sync(&self, fp: u32) -> crate::Result<Option<u64>> {
        let mut core = self.core.write().expect("lock is poisoned");
        let mut arena = self.meta.lock().expect("lock is poisoned");

        let node_id = Self::locate(&core, fp);

        let staged = {
            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get(node_id) else {
                unreachable!("descent must end at a leaf");
            };
            arena.get_mut(dram_leaf.meta).buffer.remove_key(fp)
        };

        let staged_prior = staged.map(|op| {
            self.counters.buffered_bytes.fetch_sub(STAGED_OP_BYTES, Relaxed);

            if op.kind == OpKind::Insert {
                self.reclaim_value(op.value);
                Some(op.value)
            } else {
                None
            }
        });

        let mut touched = Vec::new();
        let committed = self.apply_committed(
            &mut core,
            &mut arena,
            StagedOp {
                fp,
                value: 0,
                kind: OpKind::Delete,
            },
            &mut touched,
        )?;

        for id in touched {
            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get_mut(id) else {
                continue;
            };

            let m = arena.get_mut(dram_leaf.meta);
            self.compress_leaf(dram_leaf, m)?;
        }

        Ok(staged_prior.unwrap_or(committed.prior))
    }
}

/// The DRAM compressed B+tree.
///
/// A fixed-width map from key fingerprints to value words. Leaves are
/// partitioned into hashed sub-page regions that compress independently,
/// so a read decompresses a single sub-page. Writes are staged in per-leaf
/// buffers and applied by a background flush worker.
pub struct DramTree {
    shared: Arc<DramShared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl DramTree {
    /// Creates a tree and starts its flush worker.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the options are inconsistent.
    pub fn new(opts: DramOptions) -> crate::Result<Self> {
        Self::with_value_reclaim_inner(opts, None)
    }

    /// Creates a tree with a value-reclaim hook.
    ///
    /// The hook runs whenever a committed or staged value word is
    /// overwritten or removed, letting the owner release payload storage
    /// referenced by the word.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the options are inconsistent.
    pub fn with_value_reclaim(opts: DramOptions, hook: ReclaimFn) -> crate::Result<Self> {
        Self::with_value_reclaim_inner(opts, Some(hook))
    }

    fn with_value_reclaim_inner(
        opts: DramOptions,
        reclaim: Option<ReclaimFn>,
    ) -> crate::Result<Self> {
        opts.validate()?;

        let mut arena = MetaArena::default();
        let root_meta = arena.insert(LeafMeta::new(opts.buffer_capacity));

        let counters = Counters::default();
        counters
            .resident_bytes
            .store(opts.leaf_entries as u64 * PAIR_BYTES, Relaxed);

        let shared = Arc::new(DramShared {
            core: RwLock::new(DramCore {
                nodes: vec![DramNode::Leaf(DramLeaf::new(root_meta, opts.leaf_entries))],
                root: 0,
                clock_hand: 0,
            }),
            meta: Mutex::new(arena),
            codec_lock: Mutex::new(()),
            counters,
            queue: FlushQueue::new(),
            reclaim,
            opts,
        });

        let worker = {
            let shared = Arc::clone(&shared);

            std::thread::spawn(move || {
                while let Some(node_id) = shared.queue.next() {
                    if let Err(e) = shared.flush_leaf(node_id) {
                        shared.counters.flush_failures.fetch_add(1, Relaxed);
                        log::error!("Background flush of leaf {node_id} failed: {e:?}");
                    }
                }

                log::trace!("Flush worker shutting down");
            })
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Inserts or updates a value word.
    ///
    /// With lazy compression the operation is staged in the leaf's write
    /// buffer; a full buffer falls back to the synchronous path.
    ///
    /// # Errors
    ///
    /// Will return `Err` if decompression fails.
    pub fn insert(&self, fp: u32, value: u64) -> crate::Result<()> {
        debug_assert_ne!(0, fp, "the zero fingerprint is reserved");

        if !self.shared.opts.lazy_compression {
            return self.shared.upsert_sync(fp, value);
        }

        {
            let core = self.shared.core.read().expect("lock is poisoned");
            let node_id = DramShared::locate(&core, fp);

            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get(node_id) else {
                unreachable!("descent must end at a leaf");
            };
            dram_leaf.access.store(true, Relaxed);

            let mut arena = self.shared.meta.lock().expect("lock is poisoned");
            let m = arena.get_mut(dram_leaf.meta);

            match m.buffer.stage(StagedOp {
                fp,
                value,
                kind: OpKind::Insert,
            }) {
                StageResult::Appended => {
                    self.shared
                        .counters
                        .buffered_bytes
                        .fetch_add(STAGED_OP_BYTES, Relaxed);

                    if m.buffer.len() >= self.shared.opts.flush_threshold && !m.enqueued {
                        m.enqueued = true;
                        self.shared.queue.enqueue(node_id);
                    }

                    return Ok(());
                }
                StageResult::Replaced(old) => {
                    if old.kind == OpKind::Insert {
                        self.shared.reclaim_value(old.value);
                    }
                    return Ok(());
                }
                StageResult::Full => {}
            }
        }

        self.shared.upsert_sync(fp, value)
    }

    /// Stages a delete for a fingerprint.
    ///
    /// # Errors
    ///
    /// Will return `Err` if decompression fails on the synchronous
    /// fallback path.
    pub fn delete(&self, fp: u32) -> crate::Result<()> {
        if !self.shared.opts.lazy_compression {
            self.shared.remove_sync(fp)?;
            return Ok(());
        }

        {
            let core = self.shared.core.read().expect("lock is poisoned");
            let node_id = DramShared::locate(&core, fp);

            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get(node_id) else {
                unreachable!("descent must end at a leaf");
            };
            dram_leaf.access.store(true, Relaxed);

            let mut arena = self.shared.meta.lock().expect("lock is poisoned");
            let m = arena.get_mut(dram_leaf.meta);

            match m.buffer.stage(StagedOp {
                fp,
                value: 0,
                kind: OpKind::Delete,
            }) {
                StageResult::Appended => {
                    self.shared
                        .counters
                        .buffered_bytes
                        .fetch_add(STAGED_OP_BYTES, Relaxed);

                    if m.buffer.len() >= self.shared.opts.flush_threshold && !m.enqueued {
                        m.enqueued = true;
                        self.shared.queue.enqueue(node_id);
                    }

                    return Ok(());
                }
                StageResult::Replaced(old) => {
                    if old.kind == OpKind::Insert {
                        self.shared.reclaim_value(old.value);
                    }
                    return Ok(());
                }
                StageResult::Full => {}
            }
        }

        self.shared.remove_sync(fp)?;
        Ok(())
    }

    /// Synchronously removes a fingerprint, cancelling any staged
    /// operation for it.
    ///
    /// Returns the prior logical value (staged shadowing committed).
    /// Reclamation of the removed value word is handled through the
    /// reclaim hook, not by the caller.
    ///
    /// # Errors
    ///
    /// Will return `Err` if decompression fails.
    pub fn remove_sync(&self, fp: u32) -> crate::Result<Option<u64>> {
        self.shared.remove_sync(fp)
    }

    /// Looks up a fingerprint.
    ///
    /// The write buffer is consulted first; a staged delete answers "not
    /// found". On a compressed leaf only the target sub-page is
    /// decompressed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if decompression fails.
    pub fn get(&self, fp: u32) -> crate::Result<Option<u64>> {
        let shared = &self.shared;
        let subcap = shared.opts.subcap();

        let core = shared.core.read().expect("lock is poisoned");
        let node_id = DramShared::locate(&core, fp);

        let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get(node_id) else {
            unreachable!("descent must end at a leaf");
        };
        dram_leaf.access.store(true, Relaxed);

        let arena = shared.meta.lock().expect("lock is poisoned");
        let m = arena.get(dram_leaf.meta);

        if let Some(op) = m.buffer.lookup(fp) {
            return Ok(match op.kind {
                OpKind::Insert => Some(op.value),
                OpKind::Delete => None,
            });
        }

        let slot = sub_page_slot(fp, shared.opts.num_sub_pages);

        if m.compressed {
            let e = *m.entries.get(slot).expect("compressed leaf must have entries");

            let image = m
                .backing
                .get(e.offset as usize..(e.offset + e.len) as usize)
                .expect("sub-page image must be in bounds");

            let raw = {
                let _codec = shared.codec_guard();
                shared.opts.compression.decompress(image, e.uncompressed as usize)?
            };

            let (keys, vals) = decode_region(&raw, subcap)?;
            return Ok(region_search(&keys, &vals, fp));
        }

        if !dram_leaf.is_resident() {
            return Ok(None);
        }

        let start = slot * subcap;
        Ok(region_search(
            &dram_leaf.keys[start..start + subcap],
            &dram_leaf.vals[start..start + subcap],
            fp,
        ))
    }

    /// Synchronously drains every leaf's write buffer and recompresses
    /// the touched leaves.
    ///
    /// # Errors
    ///
    /// Will return `Err` if decompression fails.
    pub fn flush_all(&self) -> crate::Result<()> {
        let leaf_ids: Vec<usize> = {
            let core = self.shared.core.read().expect("lock is poisoned");

            core.nodes
                .iter()
                .enumerate()
                .filter_map(|(id, node)| match node {
                    DramNode::Leaf(_) => Some(id),
                    DramNode::Internal { .. } => None,
                })
                .collect()
        };

        for id in leaf_ids {
            self.shared.flush_leaf(id)?;
        }

        Ok(())
    }

    /// Range scans are not part of the point-access contract.
    ///
    /// # Errors
    ///
    /// Always returns [`crate::Error::Unsupported`].
    pub fn range(&self, _range: std::ops::Range<u32>) -> crate::Result<Vec<(u32, u64)>> {
        Err(crate::Error::Unsupported("range scans"))
    }

    /// Second-chance eviction scan.
    ///
    /// Walks the leaf clock starting at the stored hand: a leaf with its
    /// access bit set gets the bit cleared and is skipped; a cold leaf has
    /// its live pairs handed to `migrate` in one batch and, if that
    /// succeeds, its storage dropped. Leaves with staged operations are
    /// scheduled for flushing and skipped. The scan stops once
    /// `target_bytes` were freed or after two full rotations.
    ///
    /// Returns the number of bytes freed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if decompression or migration fails. A failed
    /// migration leaves its leaf untouched.
    pub fn drain_cold(
        &self,
        target_bytes: u64,
        migrate: &mut dyn FnMut(&[(u32, u64)]) -> crate::Result<()>,
    ) -> crate::Result<u64> {
        let shared = &self.shared;
        let entries = shared.opts.leaf_entries;

        let mut core = shared.core.write().expect("lock is poisoned");
        let mut arena = shared.meta.lock().expect("lock is poisoned");

        let leaf_ids: Vec<usize> = core
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(id, node)| match node {
                DramNode::Leaf(_) => Some(id),
                DramNode::Internal { .. } => None,
            })
            .collect();

        if leaf_ids.is_empty() {
            return Ok(0);
        }

        let mut freed = 0u64;
        let start = core.clock_hand;

        for step in 0..leaf_ids.len() * 2 {
            if freed >= target_bytes {
                break;
            }

            let idx = (start + step) % leaf_ids.len();
            let node_id = *leaf_ids.get(idx).expect("index is in range");
            core.clock_hand = (idx + 1) % leaf_ids.len();

            let Some(DramNode::Leaf(dram_leaf)) = core.nodes.get_mut(node_id) else {
                continue;
            };

            // Hot page: clear the bit, give it a second chance
            if dram_leaf.access.swap(false, Relaxed) {
                continue;
            }

            let m = arena.get_mut(dram_leaf.meta);

            // Unflushed staged ops; schedule a flush instead of evicting
            if m.buffer.is_dirty() {
                if !m.enqueued {
                    m.enqueued = true;
                    shared.queue.enqueue(node_id);
                }
                continue;
            }

            let (pairs, footprint) = if m.compressed {
                let subcap = shared.opts.subcap();
                let mut pairs = Vec::new();

                {
                    let _codec = shared.codec_guard();

                    for e in &m.entries {
                        let image = m
                            .backing
                            .get(e.offset as usize..(e.offset + e.len) as usize)
                            .expect("sub-page image must be in bounds");

                        let raw = shared
                            .opts
                            .compression
                            .decompress(image, e.uncompressed as usize)?;
                        let (keys, vals) = decode_region(&raw, subcap)?;

                        pairs.extend(
                            keys.iter()
                                .zip(vals.iter())
                                .filter(|&(&k, _)| k != 0)
                                .map(|(&k, &v)| (k, v)),
                        );
                    }
                }

                (pairs, m.backing.len() as u64)
            } else {
                if !dram_leaf.is_resident() {
                    continue;
                }

                let pairs: Vec<(u32, u64)> = dram_leaf
                    .keys
                    .iter()
                    .zip(dram_leaf.vals.iter())
                    .filter(|&(&k, _)| k != 0)
                    .map(|(&k, &v)| (k, v))
                    .collect();

                (pairs, entries as u64 * PAIR_BYTES)
            };

            // Migrate before dropping so readers never observe a gap
            migrate(&pairs)?;

            if m.compressed {
                shared
                    .counters
                    .uncompressed_bytes
                    .fetch_sub(entries as u64 * PAIR_BYTES, Relaxed);
                shared.counters.compressed_bytes.fetch_sub(footprint, Relaxed);
                m.compressed = false;
                m.entries.clear();
                m.backing = Vec::new();
            } else {
                shared.counters.resident_bytes.fetch_sub(footprint, Relaxed);
            }

            dram_leaf.keys = Vec::new();
            dram_leaf.vals = Vec::new();

            shared
                .counters
                .live_entries
                .fetch_sub(pairs.len() as u64, Relaxed);

            freed += footprint;

            log::trace!(
                "Evicted leaf {node_id}: {} pairs, {footprint} bytes",
                pairs.len(),
            );
        }

        Ok(freed)
    }

    /// Approximate DRAM footprint of the tree in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        let c = &self.shared.counters;
        c.resident_bytes.load(Relaxed) + c.compressed_bytes.load(Relaxed)
            + c.buffered_bytes.load(Relaxed)
    }

    /// Number of committed pairs.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.shared.counters.live_entries.load(Relaxed)
    }

    /// Whether no pairs are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical bytes across all compressed leaves.
    #[must_use]
    pub fn uncompressed_bytes(&self) -> u64 {
        self.shared.counters.uncompressed_bytes.load(Relaxed)
    }

    /// Backing-buffer bytes across all compressed leaves.
    #[must_use]
    pub fn compressed_bytes(&self) -> u64 {
        self.shared.counters.compressed_bytes.load(Relaxed)
    }

    /// Number of background flushes that failed.
    #[must_use]
    pub fn flush_failures(&self) -> u64 {
        self.shared.counters.flush_failures.load(Relaxed)
    }
}

impl Drop for DramTree {
    fn drop(&mut self) {
        self.shared.queue.shutdown();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Flush worker panicked");
            }
        }
    }
}
