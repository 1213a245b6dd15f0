// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Highest supported level for the accelerator codec
pub const ACCEL_MAX_LEVEL: u8 = 10;

/// Compression algorithm to use for DRAM sub-pages
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    Lz4,

    /// Accelerator codec (DEFLATE wire format)
    ///
    /// Matches the wire format of hardware compression offload engines;
    /// this build always takes the software fallback path.
    Accel(u8),
}

impl CompressionType {
    /// Compresses a byte region.
    ///
    /// Returns `None` if the region is incompressible, i.e. the
    /// compressed form would not be smaller than the input. Callers
    /// store such regions uncompressed and never retry.
    #[must_use]
    pub fn compress(self, src: &[u8]) -> Option<Vec<u8>> {
        let out = match self {
            Self::Lz4 => lz4_flex::compress(src),
            Self::Accel(level) => {
                miniz_oxide::deflate::compress_to_vec(src, level.min(ACCEL_MAX_LEVEL))
            }
        };

        if out.len() < src.len() {
            Some(out)
        } else {
            None
        }
    }

    /// Decompresses a byte region of known uncompressed size.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Decompress`] if the region is corrupt or does not
    /// decompress to exactly `uncompressed_len` bytes.
    pub fn decompress(self, src: &[u8], uncompressed_len: usize) -> crate::Result<Vec<u8>> {
        let out = match self {
            Self::Lz4 => lz4_flex::decompress(src, uncompressed_len)
                .map_err(|_| crate::Error::Decompress(self))?,

            Self::Accel(_) => {
                miniz_oxide::inflate::decompress_to_vec_with_limit(src, uncompressed_len)
                    .map_err(|_| crate::Error::Decompress(self))?
            }
        };

        if out.len() == uncompressed_len {
            Ok(out)
        } else {
            Err(crate::Error::Decompress(self))
        }
    }

    /// Whether the codec may be called from multiple threads at once.
    ///
    /// The owning tree serializes calls behind a mutex when this
    /// returns `false`.
    #[must_use]
    pub fn is_thread_safe(self) -> bool {
        match self {
            Self::Lz4 => true,

            // NOTE: Offload engines own a fixed set of hardware queues,
            // so submissions are serialized per tree
            Self::Accel(_) => false,
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lz4 => write!(f, "lz4"),
            Self::Accel(level) => write!(f, "accel (level {level})"),
        }
    }
}
