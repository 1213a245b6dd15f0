// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// A 64-bit payload checksum
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Checksum(u64);

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Checksum {
    /// Computes the checksum of a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_64(bytes))
    }

    /// Wraps a checksum value.
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit integer.
    #[must_use]
    pub fn into_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn check(self, expected: Self) -> crate::Result<()> {
        if self.0 == expected.0 {
            Ok(())
        } else {
            Err(crate::Error::ChecksumMismatch {
                got: self,
                expected,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn checksum_deterministic() {
        assert_eq!(Checksum::of(b"neptune"), Checksum::of(b"neptune"));
        assert_ne!(Checksum::of(b"neptune"), Checksum::of(b"saturn"));
    }

    #[test]
    fn checksum_check() -> crate::Result<()> {
        let sum = Checksum::of(b"asdasdasdasdasd");
        sum.check(sum)?;

        let err = Checksum::of(b"different").check(sum);
        assert!(matches!(err, Err(crate::Error::ChecksumMismatch { .. })));

        Ok(())
    }
}
