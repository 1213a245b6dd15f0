// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file::{read_exact_at, write_all_at, BLOCK_SIZE};
use std::{fs::File, path::Path, sync::Mutex};

/// Append-only store for large payloads.
///
/// Records are 4 KiB-aligned: `[payload | zero_pad]`. The byte offset of a
/// record is handed back as its LBA and never moves; deleting a key drops
/// its index entry only, reclamation of stale regions is out of scope.
pub struct ObjectStore {
    file: File,
    offset: Mutex<u64>,
}

fn align_up(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

impl ObjectStore {
    /// Opens (or creates) the store, appending after any existing records.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let offset = len.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64;

        log::debug!("Opening object store at {path:?}, append offset {offset}");

        Ok(Self {
            file,
            offset: Mutex::new(offset),
        })
    }

    /// Reserves an aligned region for a payload of `size` bytes and returns
    /// its LBA.
    ///
    /// The append offset is bumped under the store mutex; the caller fills
    /// the region with [`ObjectStore::write_at`].
    #[must_use]
    pub fn allocate(&self, size: usize) -> u64 {
        let mut offset = self.offset.lock().expect("lock is poisoned");
        let lba = *offset;
        *offset += align_up(size) as u64;
        lba
    }

    /// Writes a payload into its reserved region, padding up to the next
    /// 4 KiB boundary with zeroes, then syncs.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn write_at(&self, lba: u64, payload: &[u8]) -> crate::Result<()> {
        let mut buf = vec![0u8; align_up(payload.len())];

        if let Some(dst) = buf.get_mut(..payload.len()) {
            dst.copy_from_slice(payload);
        }

        write_all_at(&self.file, &buf, lba)?;
        self.file.sync_data()?;

        Ok(())
    }

    /// Appends a payload, returning its LBA.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn append(&self, payload: &[u8]) -> crate::Result<u64> {
        let lba = self.allocate(payload.len());
        self.write_at(lba, payload)?;

        log::trace!("Appended {} bytes at LBA {lba}", payload.len());

        Ok(lba)
    }

    /// Reads back `size` bytes at `lba`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn read(&self, lba: u64, size: u32) -> crate::Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        read_exact_at(&self.file, &mut buf, lba)?;
        Ok(buf)
    }

    /// Flushes OS buffers to stable storage.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn sync(&self) -> crate::Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Bytes consumed on disk, including alignment padding.
    #[must_use]
    pub fn size_on_disk(&self) -> u64 {
        *self.offset.lock().expect("lock is poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn object_store_append_read() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ObjectStore::open(&dir.path().join("objects.storage"))?;

        let a = b"hello".repeat(100);
        let b = b"world".repeat(2_000);

        let lba_a = store.append(&a)?;
        let lba_b = store.append(&b)?;

        assert_eq!(0, lba_a);
        // 500 bytes pad up to one block
        assert_eq!(BLOCK_SIZE as u64, lba_b);

        assert_eq!(a, store.read(lba_a, a.len() as u32)?);
        assert_eq!(b, store.read(lba_b, b.len() as u32)?);

        Ok(())
    }

    #[test]
    fn object_store_records_are_aligned() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ObjectStore::open(&dir.path().join("objects.storage"))?;

        for size in [1usize, 4_095, 4_096, 4_097, 10_000] {
            let lba = store.append(&vec![0xAA; size])?;
            assert_eq!(0, lba % BLOCK_SIZE as u64);
        }

        assert_eq!(0, store.size_on_disk() % BLOCK_SIZE as u64);

        Ok(())
    }

    #[test]
    fn object_store_zero_padding() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ObjectStore::open(&dir.path().join("objects.storage"))?;

        let lba = store.append(&[0xFF; 10])?;

        // The tail of the aligned window reads back as zeroes
        let window = store.read(lba, BLOCK_SIZE as u32)?;
        assert!(window[10..].iter().all(|&byte| byte == 0));

        Ok(())
    }

    #[test]
    fn object_store_reopen_appends_after_tail() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("objects.storage");

        let first = {
            let store = ObjectStore::open(&path)?;
            store.append(&[1u8; 100])?
        };

        let store = ObjectStore::open(&path)?;
        let second = store.append(&[2u8; 100])?;

        assert!(second > first);
        assert_eq!(vec![1u8; 100], store.read(first, 100)?);

        Ok(())
    }
}
