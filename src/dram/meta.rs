// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::write_buffer::WriteBuffer;

/// Location of one sub-page's compressed image inside the leaf's backing
/// buffer
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SubPageEntry {
    /// Byte offset into the backing buffer
    pub offset: u32,

    /// Compressed length; 0 means "not compressed for this sub-page"
    pub len: u32,

    /// Uncompressed length of the sub-page image
    pub uncompressed: u32,
}

/// Slot layout of a DRAM leaf
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LeafLayout {
    /// Slots partitioned into hashed sub-page regions
    #[default]
    Hashed,
}

/// Sidecar state of one DRAM leaf.
///
/// Owned by the tree through [`MetaArena`]; leaves hold an index into the
/// arena, so ownership flows tree → arena → metadata with no back-edges.
pub struct LeafMeta {
    /// Slot layout of the leaf
    pub layout: LeafLayout,

    /// One entry per sub-page when compressed
    pub entries: Vec<SubPageEntry>,

    /// Whether the leaf currently lives as compressed images
    pub compressed: bool,

    /// Single buffer holding every sub-page image back to back
    pub backing: Vec<u8>,

    /// Staged operations not yet applied to the leaf
    pub buffer: WriteBuffer,

    /// Whether the leaf is already sitting on the flush queue
    pub enqueued: bool,
}

impl LeafMeta {
    pub(crate) fn new(buffer_capacity: usize) -> Self {
        Self {
            layout: LeafLayout::Hashed,
            entries: Vec::new(),
            compressed: false,
            backing: Vec::new(),
            buffer: WriteBuffer::new(buffer_capacity),
            enqueued: false,
        }
    }
}

/// Arena of leaf metadata slots.
///
/// A leaf's metadata index stays stable for the leaf's lifetime; leaves
/// (and their metadata) live as long as the owning tree.
#[derive(Default)]
pub struct MetaArena {
    slots: Vec<LeafMeta>,
}

impl MetaArena {
    pub(crate) fn insert(&mut self, meta: LeafMeta) -> usize {
        self.slots.push(meta);
        self.slots.len() - 1
    }

    pub(crate) fn get(&self, idx: usize) -> &LeafMeta {
        self.slots.get(idx).expect("leaf metadata must exist")
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut LeafMeta {
        self.slots.get_mut(idx).expect("leaf metadata must exist")
    }
}
