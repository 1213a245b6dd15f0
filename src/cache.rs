// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checksum::Checksum,
    dram::{DramTree, TOMBSTONE},
    eviction::EvictionHandle,
    file::BLOCK_SIZE,
    fingerprint::fingerprint,
    large_object::{LargeObjectTree, ObjectDescriptor},
    object_store::ObjectStore,
    ssd_tree::SsdTree,
    stats::{Stats, StatsSnapshot},
    vault::Vault,
};
use std::sync::{
    atomic::{AtomicU32, Ordering::Relaxed},
    Arc,
};

/// Longest accepted key
pub const MAX_KEY_SIZE: usize = 256;

/// Largest accepted value (the large-object ceiling)
pub const MAX_VALUE_SIZE: u32 = 1 << 20;

/// SSD-resident small objects are stored as a packed object-store
/// reference: 4 KiB-aligned LBA index in the high bits, payload size in
/// the low 24 bits.
fn pack_ssd_ref(lba: u64, size: u32) -> u64 {
    debug_assert!(size < 1 << 24);
    ((lba / BLOCK_SIZE as u64) << 24) | u64::from(size)
}

fn unpack_ssd_ref(word: u64) -> (u64, u32) {
    #[allow(clippy::cast_possible_truncation)]
    let size = (word & 0x00FF_FFFF) as u32;
    ((word >> 24) * BLOCK_SIZE as u64, size)
}

pub(crate) struct CacheInner {
    pub(crate) dram: DramTree,
    pub(crate) ssd: SsdTree,
    pub(crate) large: LargeObjectTree,
    pub(crate) store: ObjectStore,
    pub(crate) vault: Arc<Vault>,
    pub(crate) stats: Stats,
    pub(crate) tiny_max: AtomicU32,
    pub(crate) medium_max: AtomicU32,
    pub(crate) dram_capacity: u64,
    pub(crate) promote: bool,
}

impl CacheInner {
    fn memory_usage(&self) -> u64 {
        self.vault.bytes() + self.dram.memory_bytes()
    }

    pub(crate) fn note_eviction_failure(&self) {
        self.stats.eviction_failures.fetch_add(1, Relaxed);
    }

    /// Runs one eviction pass if DRAM usage is at the high watermark
    /// (90 % of capacity). Frees towards 10 % of capacity by migrating
    /// cold leaves into the SSD tier.
    pub(crate) fn maybe_evict(&self) -> crate::Result<()> {
        let usage = self.memory_usage();

        if usage * 10 < self.dram_capacity * 9 {
            return Ok(());
        }

        let target = self.dram_capacity / 10;

        log::debug!(
            "Eviction pass: {usage} of {} DRAM bytes used, freeing {target}",
            self.dram_capacity,
        );

        let mut migrated_keys = 0u64;
        let mut migrated_bytes = 0u64;

        let freed = self.dram.drain_cold(target, &mut |pairs| {
            let mut handles = Vec::with_capacity(pairs.len());

            for &(fp, value) in pairs {
                // Tombstones are dropped, not migrated; the live value
                // sits in the large-object tier
                if value == TOMBSTONE {
                    continue;
                }

                let Some(payload) = self.vault.get(value) else {
                    log::warn!("Dangling payload handle for fingerprint {fp}");
                    continue;
                };

                #[allow(clippy::cast_possible_truncation)]
                let size = payload.len() as u32;

                let lba = self.store.append(&payload)?;
                self.ssd.insert(fp, pack_ssd_ref(lba, size))?;

                migrated_bytes += u64::from(size);
                handles.push(value);
            }

            // The leaf's storage is dropped right after this returns, so
            // the handles die with it
            migrated_keys += handles.len() as u64;
            for handle in handles {
                self.vault.release(handle);
            }

            Ok(())
        })?;

        self.stats.evicted_keys.fetch_add(migrated_keys, Relaxed);
        self.stats
            .evicted_bytes
            .fetch_add(freed + migrated_bytes, Relaxed);

        log::debug!("Evicted {migrated_keys} keys, freed {freed} tree bytes");

        Ok(())
    }
}

/// The tier orchestrator: one point-access cache across the DRAM tree,
/// the large-object tier and the SSD tree.
///
/// Values are routed by size: tiny and medium payloads live in DRAM (and
/// spill to the SSD tree under memory pressure), large payloads go to the
/// SSD object store with a descriptor in the large-object index and a
/// tombstone in DRAM. Reads probe DRAM, then the large-object index, then
/// the SSD tree.
pub struct ZipCache {
    pub(crate) inner: Arc<CacheInner>,
    pub(crate) eviction: Option<EvictionHandle>,
}

enum SizeClass {
    Tiny,
    Medium,
    Large,
}

impl ZipCache {
    fn classify(&self, size: u32) -> SizeClass {
        if size <= self.inner.tiny_max.load(Relaxed) {
            SizeClass::Tiny
        } else if size <= self.inner.medium_max.load(Relaxed) {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    fn validate_key(key: &[u8]) -> crate::Result<u32> {
        if key.len() > MAX_KEY_SIZE {
            return Err(crate::Error::KeyTooLong(key.len()));
        }

        Ok(fingerprint(key))
    }

    /// Stores a value.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the key or value size is out of range, or an
    /// IO error occurs. A failed write appears not to have taken effect.
    pub fn put(&self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        let fp = Self::validate_key(key)?;

        let size = u32::try_from(value.len()).unwrap_or(u32::MAX);
        if size == 0 || size > MAX_VALUE_SIZE {
            return Err(crate::Error::InvalidValueSize(size));
        }

        let inner = &self.inner;

        match self.classify(size) {
            class @ (SizeClass::Tiny | SizeClass::Medium) => {
                let handle = inner.vault.insert(value);
                inner.dram.insert(fp, handle)?;

                // A previous large value for this key is now stale
                if inner.large.remove(fp).is_some() {
                    log::trace!("Invalidated stale descriptor for fingerprint {fp}");
                }

                match class {
                    SizeClass::Tiny => inner.stats.puts_tiny.fetch_add(1, Relaxed),
                    _ => inner.stats.puts_medium.fetch_add(1, Relaxed),
                };
            }

            SizeClass::Large => {
                let checksum = Checksum::of(value);
                let lba = inner.store.append(value)?;

                inner
                    .large
                    .insert(fp, ObjectDescriptor::new(lba, size, checksum));
                inner.dram.insert(fp, TOMBSTONE)?;

                inner.stats.puts_large.fetch_add(1, Relaxed);
                inner.stats.tombstones.fetch_add(1, Relaxed);
            }
        }

        Ok(())
    }

    /// Looks up a value.
    ///
    /// Probes DRAM first (a tombstone falls through to the large-object
    /// tier), then the large-object index with checksum verification, then
    /// the SSD tree. SSD hits are optionally promoted back into DRAM.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or a large object fails
    /// checksum verification.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        let fp = Self::validate_key(key)?;
        let inner = &self.inner;

        inner.stats.gets.fetch_add(1, Relaxed);

        match inner.dram.get(fp)? {
            Some(TOMBSTONE) | None => {}
            Some(handle) => {
                if let Some(payload) = inner.vault.get(handle) {
                    inner.stats.hits_dram.fetch_add(1, Relaxed);
                    return Ok(Some(payload));
                }

                log::warn!("Dangling payload handle for fingerprint {fp}");
            }
        }

        if let Some(desc) = inner.large.get(fp) {
            let payload = inner.store.read(desc.lba, desc.size)?;
            desc.verify(&payload)?;

            inner.stats.hits_large.fetch_add(1, Relaxed);
            return Ok(Some(payload));
        }

        if let Some(word) = inner.ssd.get(fp)? {
            let (lba, size) = unpack_ssd_ref(word);
            let payload = inner.store.read(lba, size)?;

            inner.stats.hits_ssd.fetch_add(1, Relaxed);

            if inner.promote {
                let handle = inner.vault.insert(&payload);
                inner.dram.insert(fp, handle)?;
                inner.ssd.remove(fp)?;
                inner.stats.promotions.fetch_add(1, Relaxed);
            }

            return Ok(Some(payload));
        }

        inner.stats.misses.fetch_add(1, Relaxed);
        Ok(None)
    }

    /// Removes a key from every tier.
    ///
    /// Returns whether any tier held a live value. Idempotent on absent
    /// keys.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn delete(&self, key: &[u8]) -> crate::Result<bool> {
        let fp = Self::validate_key(key)?;
        let inner = &self.inner;

        inner.stats.deletes.fetch_add(1, Relaxed);

        let prior = inner.dram.remove_sync(fp)?;
        let in_dram = matches!(prior, Some(value) if value != TOMBSTONE);

        let in_large = inner.large.remove(fp).is_some();
        let in_ssd = inner.ssd.remove(fp)?.is_some();

        Ok(in_dram || in_large || in_ssd)
    }

    /// Updates the size-class thresholds.
    ///
    /// # Errors
    ///
    /// Will return `Err` unless `0 < tiny_max < medium_max` below the
    /// large-object ceiling.
    pub fn set_thresholds(&self, tiny_max: u32, medium_max: u32) -> crate::Result<()> {
        if tiny_max == 0 || tiny_max >= medium_max || medium_max >= MAX_VALUE_SIZE {
            return Err(crate::Error::InvalidConfig(
                "thresholds must satisfy 0 < tiny_max < medium_max < large ceiling",
            ));
        }

        self.inner.tiny_max.store(tiny_max, Relaxed);
        self.inner.medium_max.store(medium_max, Relaxed);

        Ok(())
    }

    /// Current size-class thresholds `(tiny_max, medium_max)`.
    #[must_use]
    pub fn get_thresholds(&self) -> (u32, u32) {
        (
            self.inner.tiny_max.load(Relaxed),
            self.inner.medium_max.load(Relaxed),
        )
    }

    /// Point-in-time counters across all tiers.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let inner = &self.inner;
        let mut snapshot = inner.stats.counters();

        snapshot.flush_failures = inner.dram.flush_failures();
        snapshot.dram_uncompressed_bytes = inner.dram.uncompressed_bytes();
        snapshot.dram_compressed_bytes = inner.dram.compressed_bytes();
        snapshot.dram_used_bytes = inner.memory_usage();
        snapshot.ssd_entries = inner.ssd.len() as u64;
        snapshot.large_objects = inner.large.len() as u64;

        snapshot
    }

    /// Drains write buffers and flushes every tier to stable storage.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&self) -> crate::Result<()> {
        self.inner.dram.flush_all()?;
        self.inner.ssd.flush()?;
        self.inner.store.sync()
    }

    /// Range scans are not part of the point-access contract.
    ///
    /// # Errors
    ///
    /// Always returns [`crate::Error::Unsupported`].
    pub fn range(&self, _start: &[u8], _end: &[u8]) -> crate::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Err(crate::Error::Unsupported("range scans"))
    }

    /// Runs one eviction pass right now instead of waiting for the
    /// background worker.
    ///
    /// # Errors
    ///
    /// Will return `Err` if migration fails.
    #[doc(hidden)]
    pub fn evict_now(&self) -> crate::Result<()> {
        self.inner.maybe_evict()
    }
}

impl Drop for ZipCache {
    fn drop(&mut self) {
        if let Some(handle) = self.eviction.take() {
            handle.stop();
        }

        if let Err(e) = self.inner.dram.flush_all() {
            log::error!("Flush on close failed: {e:?}");
        }

        if let Err(e) = self.inner.ssd.flush() {
            log::error!("SSD flush on close failed: {e:?}");
        }

        if let Err(e) = self.inner.store.sync() {
            log::error!("Object store sync on close failed: {e:?}");
        }
    }
}
