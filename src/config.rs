// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::{CacheInner, ZipCache, MAX_VALUE_SIZE},
    compression::CompressionType,
    dram::{DramOptions, DramTree},
    large_object::LargeObjectTree,
    object_store::ObjectStore,
    ssd_tree::SsdTree,
    stats::Stats,
    vault::Vault,
};
use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicU32, Arc},
    time::Duration,
};

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut os = prefix.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Cache configuration builder
///
/// The path prefix names the three on-disk files: `<prefix>.ssd` (the SSD
/// tree's block file), `<prefix>.storage` (the large-object store) and
/// `<prefix>.lo` (kept for layout compatibility).
pub struct Config {
    path_prefix: PathBuf,

    /// DRAM byte budget; eviction starts at 90 %
    pub dram_capacity_bytes: u64,

    /// Upper bound of the tiny size class
    pub tiny_max: u32,

    /// Upper bound of the medium size class
    pub medium_max: u32,

    /// Sub-page regions per DRAM leaf (the SSD super-leaf count is fixed
    /// at 16)
    pub num_sub_pages: usize,

    /// Codec for DRAM sub-page images
    pub compression: CompressionType,

    /// DRAM internal node fanout
    pub dram_order: usize,

    /// Slots per DRAM leaf
    pub dram_leaf_entries: usize,

    /// SSD tree internal node fanout
    pub ssd_order: usize,

    /// SSD tree file size in 4 KiB blocks
    pub total_blocks: u32,

    /// Hard cap of each DRAM leaf's write buffer
    pub write_buffer_capacity: usize,

    /// Buffered entry count that triggers a background flush
    pub flush_threshold: usize,

    /// Buffered vs synchronous DRAM write path
    pub lazy_compression: bool,

    /// Promote SSD hits back into DRAM
    pub promote_on_ssd_hit: bool,

    /// Wake period of the eviction worker
    pub eviction_interval: Duration,
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new<P: Into<PathBuf>>(path_prefix: P) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            dram_capacity_bytes: /* 64 MiB */ 64 * 1_024 * 1_024,
            tiny_max: 128,
            medium_max: 2_048,
            num_sub_pages: 16,
            compression: CompressionType::Lz4,
            dram_order: 64,
            dram_leaf_entries: 1_024,
            ssd_order: crate::ssd_tree::DEFAULT_SSD_ORDER,
            total_blocks: 1 << 18,
            write_buffer_capacity: 256,
            flush_threshold: 64,
            lazy_compression: true,
            promote_on_ssd_hit: true,
            eviction_interval: Duration::from_millis(200),
        }
    }

    /// Sets the DRAM byte budget.
    #[must_use]
    pub fn dram_capacity_bytes(mut self, bytes: u64) -> Self {
        self.dram_capacity_bytes = bytes;
        self
    }

    /// Sets the size-class thresholds.
    #[must_use]
    pub fn thresholds(mut self, tiny_max: u32, medium_max: u32) -> Self {
        self.tiny_max = tiny_max;
        self.medium_max = medium_max;
        self
    }

    /// Sets the DRAM sub-page compression codec.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the DRAM leaf shape.
    #[must_use]
    pub fn dram_leaf(mut self, entries: usize, num_sub_pages: usize) -> Self {
        self.dram_leaf_entries = entries;
        self.num_sub_pages = num_sub_pages;
        self
    }

    /// Sets the SSD tree file size in 4 KiB blocks.
    ///
    /// Defaults to 2^18 blocks (a 1 GiB file).
    #[must_use]
    pub fn total_blocks(mut self, blocks: u32) -> Self {
        self.total_blocks = blocks;
        self
    }

    /// Sets the write-buffer hard cap and flush threshold.
    #[must_use]
    pub fn write_buffer(mut self, capacity: usize, flush_threshold: usize) -> Self {
        self.write_buffer_capacity = capacity;
        self.flush_threshold = flush_threshold;
        self
    }

    /// Toggles the buffered write path.
    #[must_use]
    pub fn lazy_compression(mut self, enabled: bool) -> Self {
        self.lazy_compression = enabled;
        self
    }

    /// Toggles promotion of SSD hits into DRAM.
    #[must_use]
    pub fn promote_on_ssd_hit(mut self, enabled: bool) -> Self {
        self.promote_on_ssd_hit = enabled;
        self
    }

    /// Sets the eviction worker wake period.
    #[must_use]
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Opens the cache, creating its files as needed and starting the
    /// background workers.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration is inconsistent or an IO
    /// error occurs.
    pub fn open(self) -> crate::Result<ZipCache> {
        if self.tiny_max == 0 || self.tiny_max >= self.medium_max || self.medium_max >= MAX_VALUE_SIZE
        {
            return Err(crate::Error::InvalidConfig(
                "thresholds must satisfy 0 < tiny_max < medium_max < large ceiling",
            ));
        }
        if self.dram_capacity_bytes == 0 {
            return Err(crate::Error::InvalidConfig(
                "dram_capacity_bytes must be non-zero",
            ));
        }

        if let Some(parent) = self.path_prefix.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        log::info!("Opening cache at {:?}", self.path_prefix);

        let vault = Arc::new(Vault::new());

        let dram = {
            let vault = Arc::clone(&vault);

            DramTree::with_value_reclaim(
                DramOptions {
                    order: self.dram_order,
                    leaf_entries: self.dram_leaf_entries,
                    num_sub_pages: self.num_sub_pages,
                    compression: self.compression,
                    flush_threshold: self.flush_threshold,
                    buffer_capacity: self.write_buffer_capacity,
                    lazy_compression: self.lazy_compression,
                },
                Box::new(move |word| vault.release(word)),
            )?
        };

        let ssd = SsdTree::open(
            &with_suffix(&self.path_prefix, ".ssd"),
            self.total_blocks,
            self.ssd_order,
        )?;

        let store = ObjectStore::open(&with_suffix(&self.path_prefix, ".storage"))?;

        // Kept for layout compatibility; the large-object index itself is
        // held in memory
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(with_suffix(&self.path_prefix, ".lo"))?;

        let inner = Arc::new(CacheInner {
            dram,
            ssd,
            large: LargeObjectTree::new(),
            store,
            vault,
            stats: Stats::default(),
            tiny_max: AtomicU32::new(self.tiny_max),
            medium_max: AtomicU32::new(self.medium_max),
            dram_capacity: self.dram_capacity_bytes,
            promote: self.promote_on_ssd_hit,
        });

        let eviction = crate::eviction::spawn(Arc::clone(&inner), self.eviction_interval);

        Ok(ZipCache {
            inner,
            eviction: Some(eviction),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn config_rejects_bad_thresholds() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        for (tiny, medium) in [(0u32, 100u32), (100, 100), (200, 100), (1, MAX_VALUE_SIZE)] {
            let result = Config::new(dir.path().join("cache"))
                .thresholds(tiny, medium)
                .open();

            assert!(
                matches!(result, Err(crate::Error::InvalidConfig(_))),
                "accepted ({tiny}, {medium})",
            );
        }

        Ok(())
    }

    #[test]
    fn config_creates_files() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("cache");

        let _cache = Config::new(&prefix).total_blocks(1_024).open()?;

        assert!(with_suffix(&prefix, ".ssd").try_exists()?);
        assert!(with_suffix(&prefix, ".storage").try_exists()?);
        assert!(with_suffix(&prefix, ".lo").try_exists()?);

        assert_eq!(
            1_024 * crate::file::BLOCK_SIZE as u64,
            std::fs::metadata(with_suffix(&prefix, ".ssd"))?.len(),
        );

        Ok(())
    }
}
