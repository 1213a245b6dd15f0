// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::checksum::Checksum;

/// Points at a payload inside the SSD object store
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectDescriptor {
    /// Byte offset of the record inside the store
    pub lba: u64,

    /// Payload length; the on-disk record is padded up to 4 KiB
    pub size: u32,

    /// Checksum over the payload bytes
    pub checksum: Checksum,

    /// Wall-clock write time in seconds, for observability
    pub timestamp: u64,
}

impl ObjectDescriptor {
    /// Creates a descriptor stamped with the current time.
    #[must_use]
    pub fn new(lba: u64, size: u32, checksum: Checksum) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            lba,
            size,
            checksum,
            timestamp,
        }
    }

    /// Verifies a payload against the stored checksum.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChecksumMismatch`] on a byte-level mismatch.
    pub fn verify(&self, payload: &[u8]) -> crate::Result<()> {
        Checksum::of(payload).check(self.checksum)
    }
}
