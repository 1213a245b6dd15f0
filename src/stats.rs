// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Live operation counters of a cache instance
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) puts_tiny: AtomicU64,
    pub(crate) puts_medium: AtomicU64,
    pub(crate) puts_large: AtomicU64,
    pub(crate) gets: AtomicU64,
    pub(crate) hits_dram: AtomicU64,
    pub(crate) hits_large: AtomicU64,
    pub(crate) hits_ssd: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) tombstones: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) promotions: AtomicU64,
    pub(crate) evicted_keys: AtomicU64,
    pub(crate) evicted_bytes: AtomicU64,
    pub(crate) eviction_failures: AtomicU64,
}

/// Point-in-time view of a cache's counters.
///
/// Consistent per tree; no cross-tree snapshot is promised.
#[derive(Clone, Copy, Debug, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct StatsSnapshot {
    /// PUTs that classified as tiny
    pub puts_tiny: u64,

    /// PUTs that classified as medium
    pub puts_medium: u64,

    /// PUTs that classified as large
    pub puts_large: u64,

    /// GET calls
    pub gets: u64,

    /// GETs answered from the DRAM tree
    pub hits_dram: u64,

    /// GETs answered from the large-object tier
    pub hits_large: u64,

    /// GETs answered from the SSD tree
    pub hits_ssd: u64,

    /// GETs that found nothing
    pub misses: u64,

    /// Tombstones written into the DRAM tree by large PUTs
    pub tombstones: u64,

    /// DELETE calls
    pub deletes: u64,

    /// SSD hits promoted back into DRAM
    pub promotions: u64,

    /// Keys migrated to the SSD tier by eviction
    pub evicted_keys: u64,

    /// DRAM bytes freed by eviction
    pub evicted_bytes: u64,

    /// Eviction passes that failed
    pub eviction_failures: u64,

    /// Background flushes that failed
    pub flush_failures: u64,

    /// Logical bytes across compressed DRAM leaves
    pub dram_uncompressed_bytes: u64,

    /// Compressed-image bytes across DRAM leaves
    pub dram_compressed_bytes: u64,

    /// Approximate DRAM footprint (tree and payload vault)
    pub dram_used_bytes: u64,

    /// Pairs in the SSD tree
    pub ssd_entries: u64,

    /// Descriptors in the large-object index
    pub large_objects: u64,
}

impl StatsSnapshot {
    /// DRAM compression ratio (compressed / uncompressed), or 1.0 if
    /// nothing is compressed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f64 {
        if self.dram_uncompressed_bytes == 0 {
            1.0
        } else {
            self.dram_compressed_bytes as f64 / self.dram_uncompressed_bytes as f64
        }
    }
}

impl Stats {
    pub(crate) fn counters(&self) -> StatsSnapshot {
        StatsSnapshot {
            puts_tiny: self.puts_tiny.load(Relaxed),
            puts_medium: self.puts_medium.load(Relaxed),
            puts_large: self.puts_large.load(Relaxed),
            gets: self.gets.load(Relaxed),
            hits_dram: self.hits_dram.load(Relaxed),
            hits_large: self.hits_large.load(Relaxed),
            hits_ssd: self.hits_ssd.load(Relaxed),
            misses: self.misses.load(Relaxed),
            tombstones: self.tombstones.load(Relaxed),
            deletes: self.deletes.load(Relaxed),
            promotions: self.promotions.load(Relaxed),
            evicted_keys: self.evicted_keys.load(Relaxed),
            evicted_bytes: self.evicted_bytes.load(Relaxed),
            eviction_failures: self.eviction_failures.load(Relaxed),
            ..StatsSnapshot::default()
        }
    }
}
