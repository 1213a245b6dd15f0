// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{checksum::Checksum, compression::CompressionType};

/// Represents errors that can occur in the cache
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Decompression failed
    Decompress(CompressionType),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum computed over the bytes that were read
        got: Checksum,

        /// Checksum stored in the object descriptor
        expected: Checksum,
    },

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// Value size is zero or exceeds the large-object ceiling
    InvalidValueSize(u32),

    /// Key exceeds the maximum key size
    KeyTooLong(usize),

    /// Block allocator or object store is out of room
    SpaceExhausted,

    /// A sub-page is full but its super-leaf is below the split watermark
    LeafOverflow,

    /// Operation is not supported
    Unsupported(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ZipCacheError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Cache result
pub type Result<T> = std::result::Result<T, Error>;
