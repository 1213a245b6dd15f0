// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{binary_search::partition_point, file::BLOCK_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Serialized size of the sub-page header
///
/// ```text
/// i32 entries; i32 next_sibling; i32 reserved[2];
/// ```
pub const SUB_PAGE_HEADER_SIZE: usize = 16;

/// Number of key/value pairs a sub-page can hold
///
/// Keys and values fill the block exactly, so the only bytes that need
/// zeroing before a write are the unused array slots.
pub const SUB_PAGE_CAP: usize =
    (BLOCK_SIZE - SUB_PAGE_HEADER_SIZE) / (size_of::<u32>() + size_of::<u64>());

const NO_SIBLING: i32 = -1;

/// Outcome of [`SubPage::insert`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubPageInsert {
    /// A new pair was added
    Inserted,

    /// The fingerprint already existed; holds the replaced value
    Updated(u64),

    /// The sub-page is full; nothing was changed
    Full,
}

/// One 4 KiB record of sorted fingerprint/value pairs.
///
/// The unit of compression, I/O and intra-leaf hash routing. Unused key
/// and value slots are kept zeroed at all times so the serialized block
/// compresses well downstream.
pub struct SubPage {
    entries: usize,
    next_sibling: i32,
    keys: [u32; SUB_PAGE_CAP],
    vals: [u64; SUB_PAGE_CAP],
}

impl SubPage {
    /// Creates an empty sub-page.
    #[must_use]
    pub fn new() -> Box<Self> {
        Box::new(Self {
            entries: 0,
            next_sibling: NO_SIBLING,
            keys: [0; SUB_PAGE_CAP],
            vals: [0; SUB_PAGE_CAP],
        })
    }

    /// Number of live pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the sub-page holds no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Whether every slot is occupied.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries == SUB_PAGE_CAP
    }

    /// Inserts or updates a pair, keeping keys strictly sorted.
    pub fn insert(&mut self, fp: u32, value: u64) -> SubPageInsert {
        let idx = partition_point(&self.keys[..self.entries], |&k| k < fp);

        if idx < self.entries && self.keys[idx] == fp {
            let old = self.vals[idx];
            self.vals[idx] = value;
            return SubPageInsert::Updated(old);
        }

        if self.is_full() {
            return SubPageInsert::Full;
        }

        self.keys.copy_within(idx..self.entries, idx + 1);
        self.vals.copy_within(idx..self.entries, idx + 1);
        self.keys[idx] = fp;
        self.vals[idx] = value;
        self.entries += 1;

        SubPageInsert::Inserted
    }

    /// Looks up a fingerprint.
    #[must_use]
    pub fn search(&self, fp: u32) -> Option<u64> {
        let idx = partition_point(&self.keys[..self.entries], |&k| k < fp);

        if idx < self.entries && self.keys[idx] == fp {
            Some(self.vals[idx])
        } else {
            None
        }
    }

    /// Removes a fingerprint, returning its value.
    ///
    /// The vacated slot is zeroed again.
    pub fn delete(&mut self, fp: u32) -> Option<u64> {
        let idx = partition_point(&self.keys[..self.entries], |&k| k < fp);

        if idx >= self.entries || self.keys[idx] != fp {
            return None;
        }

        let old = self.vals[idx];

        self.keys.copy_within((idx + 1)..self.entries, idx);
        self.vals.copy_within((idx + 1)..self.entries, idx);
        self.entries -= 1;
        self.keys[self.entries] = 0;
        self.vals[self.entries] = 0;

        Some(old)
    }

    /// Iterates over the live pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.keys
            .iter()
            .zip(self.vals.iter())
            .take(self.entries)
            .map(|(&k, &v)| (k, v))
    }

    /// Serializes into a block buffer, zero-filling everything unused.
    pub fn write_to(&self, buf: &mut [u8; BLOCK_SIZE]) {
        buf.fill(0);

        let mut w = &mut buf[..];

        // NOTE: The buffer is block-sized, serialization cannot fail
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        w.write_i32::<LittleEndian>(self.entries as i32)
            .expect("cannot fail");
        w.write_i32::<LittleEndian>(self.next_sibling)
            .expect("cannot fail");
        w.write_i32::<LittleEndian>(0).expect("cannot fail");
        w.write_i32::<LittleEndian>(0).expect("cannot fail");

        for key in &self.keys {
            w.write_u32::<LittleEndian>(*key).expect("cannot fail");
        }

        for value in &self.vals {
            w.write_u64::<LittleEndian>(*value).expect("cannot fail");
        }
    }

    /// Deserializes from a block buffer.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the header is malformed.
    pub fn read_from(buf: &[u8; BLOCK_SIZE]) -> crate::Result<Box<Self>> {
        let mut r = &buf[..];

        let entries = r.read_i32::<LittleEndian>()?;

        #[allow(clippy::cast_possible_wrap)]
        if !(0..=SUB_PAGE_CAP as i32).contains(&entries) {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid sub-page entry count {entries}"),
            )));
        }

        let next_sibling = r.read_i32::<LittleEndian>()?;
        let _reserved = (
            r.read_i32::<LittleEndian>()?,
            r.read_i32::<LittleEndian>()?,
        );

        let mut page = Self::new();

        #[allow(clippy::cast_sign_loss)]
        {
            page.entries = entries as usize;
        }
        page.next_sibling = next_sibling;

        for key in &mut page.keys {
            *key = r.read_u32::<LittleEndian>()?;
        }

        for value in &mut page.vals {
            *value = r.read_u64::<LittleEndian>()?;
        }

        Ok(page)
    }
}
