// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Substitute for keys whose derived fingerprint is zero.
///
/// The DRAM tree uses fingerprint 0 as its empty-slot marker, so the zero
/// fingerprint is reserved and remapped to this fixed value.
pub const ZERO_FP_SUBSTITUTE: u32 = 0x5bd1_e995;

const KNUTH_MULTIPLIER: u32 = 2_654_435_761;

/// Derives the 32-bit fingerprint of an application key.
///
/// This is the comparison key inside every B+tree of the cache, so all
/// tiers agree on ordering. Never returns 0 (see [`ZERO_FP_SUBSTITUTE`]).
#[must_use]
pub fn fingerprint(key: &[u8]) -> u32 {
    // NOTE: Truncation is fine, we just want 32 bits of the digest
    #[allow(clippy::cast_possible_truncation)]
    let fp = xxhash_rust::xxh3::xxh3_64(key) as u32;

    if fp == 0 {
        ZERO_FP_SUBSTITUTE
    } else {
        fp
    }
}

/// Maps a fingerprint to its sub-page slot.
///
/// Knuth multiplicative hash modulo the sub-page count. The DRAM and SSD
/// tiers share this function so identical keys route to the same slot in
/// both, before and after any split.
#[must_use]
pub fn sub_page_slot(fp: u32, num_sub_pages: usize) -> usize {
    fp.wrapping_mul(KNUTH_MULTIPLIER) as usize % num_sub_pages
}
