// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    fs::File,
    path::Path,
    sync::Mutex,
};

/// Size of one storage block
pub const BLOCK_SIZE: usize = 4_096;

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut pos = 0;

    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;

        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "reached EOF during positional read",
            ));
        }

        pos += n;
    }

    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut pos = 0;

    while pos < buf.len() {
        let n = file.seek_write(&buf[pos..], offset + pos as u64)?;
        pos += n;
    }

    Ok(())
}

/// A file addressed in 4 KiB blocks.
///
/// Block `i` begins at byte offset `i * 4096`. All reads and writes cover
/// exactly one block and go through a per-descriptor mutex.
pub struct BlockFile {
    file: Mutex<File>,
}

impl BlockFile {
    /// Opens (or creates) a block file, growing it to `total_blocks` blocks
    /// if it is smaller.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open(path: &Path, total_blocks: u32) -> crate::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let wanted = u64::from(total_blocks) * BLOCK_SIZE as u64;

        if file.metadata()?.len() < wanted {
            log::trace!("Growing {path:?} to {wanted} bytes");
            file.set_len(wanted)?;
        }

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Reads one block.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn read_block(&self, id: u32, buf: &mut [u8; BLOCK_SIZE]) -> crate::Result<()> {
        let file = self.file.lock().expect("lock is poisoned");
        read_exact_at(&file, buf, u64::from(id) * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Writes one block.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn write_block(&self, id: u32, buf: &[u8; BLOCK_SIZE]) -> crate::Result<()> {
        let file = self.file.lock().expect("lock is poisoned");
        write_all_at(&file, buf, u64::from(id) * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Flushes OS buffers to stable storage.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn sync(&self) -> crate::Result<()> {
        let file = self.file.lock().expect("lock is poisoned");
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_file_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = BlockFile::open(&dir.path().join("blocks"), 8)?;

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;

        file.write_block(5, &block)?;

        let mut read = [0u8; BLOCK_SIZE];
        file.read_block(5, &mut read)?;
        assert_eq!(block, read);

        // Untouched block is zero-filled
        file.read_block(3, &mut read)?;
        assert!(read.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn block_file_grows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks");

        {
            let _file = BlockFile::open(&path, 4)?;
        }
        assert_eq!(4 * BLOCK_SIZE as u64, std::fs::metadata(&path)?.len());

        // Re-opening with a bigger geometry grows the file
        {
            let _file = BlockFile::open(&path, 16)?;
        }
        assert_eq!(16 * BLOCK_SIZE as u64, std::fs::metadata(&path)?.len());

        Ok(())
    }
}
