// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::binary_search::partition_point;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::sync::atomic::AtomicBool;

/// One leaf of the DRAM tree.
///
/// When resident, `keys`/`vals` hold the full slot arrays, partitioned into
/// hashed sub-page regions with fingerprint 0 marking empty slots. When the
/// leaf is compressed (or its storage was evicted) the arrays are empty and
/// the content lives in the metadata sidecar's backing buffer.
pub(crate) struct DramLeaf {
    pub keys: Vec<u32>,
    pub vals: Vec<u64>,

    /// Index into the tree's metadata arena
    pub meta: usize,

    /// Clock bit for second-chance eviction, set on every access
    pub access: AtomicBool,
}

impl DramLeaf {
    pub fn new(meta: usize, entries: usize) -> Self {
        Self {
            keys: vec![0; entries],
            vals: vec![0; entries],
            meta,
            access: AtomicBool::new(false),
        }
    }

    pub fn is_resident(&self) -> bool {
        !self.keys.is_empty()
    }
}

/// Outcome of [`region_insert`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RegionInsert {
    Inserted,
    Updated(u64),
    Full,
}

/// Number of live pairs in a region (the occupied sorted prefix).
pub(crate) fn region_len(keys: &[u32]) -> usize {
    partition_point(keys, |&k| k != 0)
}

/// Inserts or updates a pair inside one sub-page region, keeping the
/// occupied prefix strictly sorted.
pub(crate) fn region_insert(keys: &mut [u32], vals: &mut [u64], fp: u32, value: u64) -> RegionInsert {
    let len = region_len(keys);
    let idx = partition_point(&keys[..len], |&k| k < fp);

    if idx < len && keys[idx] == fp {
        let old = vals[idx];
        vals[idx] = value;
        return RegionInsert::Updated(old);
    }

    if len == keys.len() {
        return RegionInsert::Full;
    }

    keys.copy_within(idx..len, idx + 1);
    vals.copy_within(idx..len, idx + 1);
    keys[idx] = fp;
    vals[idx] = value;

    RegionInsert::Inserted
}

/// Looks up a fingerprint inside one sub-page region.
pub(crate) fn region_search(keys: &[u32], vals: &[u64], fp: u32) -> Option<u64> {
    let len = region_len(keys);
    let idx = partition_point(&keys[..len], |&k| k < fp);

    if idx < len && keys[idx] == fp {
        Some(vals[idx])
    } else {
        None
    }
}

/// Removes a fingerprint from one sub-page region, zeroing the vacated
/// slot.
pub(crate) fn region_remove(keys: &mut [u32], vals: &mut [u64], fp: u32) -> Option<u64> {
    let len = region_len(keys);
    let idx = partition_point(&keys[..len], |&k| k < fp);

    if idx >= len || keys[idx] != fp {
        return None;
    }

    let old = vals[idx];

    keys.copy_within((idx + 1)..len, idx);
    vals.copy_within((idx + 1)..len, idx);
    keys[len - 1] = 0;
    vals[len - 1] = 0;

    Some(old)
}

/// Serializes one region (keys, then values) into a scratch buffer.
pub(crate) fn encode_region(keys: &[u32], vals: &[u64], out: &mut Vec<u8>) {
    out.clear();

    for key in keys {
        out.write_u32::<LittleEndian>(*key).expect("cannot fail");
    }

    for value in vals {
        out.write_u64::<LittleEndian>(*value).expect("cannot fail");
    }
}

/// Deserializes one region produced by [`encode_region`].
pub(crate) fn decode_region(raw: &[u8], subcap: usize) -> crate::Result<(Vec<u32>, Vec<u64>)> {
    let mut r = raw;
    let mut keys = vec![0u32; subcap];
    let mut vals = vec![0u64; subcap];

    for key in &mut keys {
        *key = r.read_u32::<LittleEndian>()?;
    }

    for value in &mut vals {
        *value = r.read_u64::<LittleEndian>()?;
    }

    Ok((keys, vals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn region_insert_sorted_prefix() {
        let mut keys = vec![0u32; 8];
        let mut vals = vec![0u64; 8];

        for fp in [40u32, 10, 30, 20] {
            assert_eq!(
                RegionInsert::Inserted,
                region_insert(&mut keys, &mut vals, fp, u64::from(fp)),
            );
        }

        assert_eq!(vec![10, 20, 30, 40, 0, 0, 0, 0], keys);
        assert_eq!(4, region_len(&keys));
        assert_eq!(Some(30), region_search(&keys, &vals, 30));
        assert_eq!(None, region_search(&keys, &vals, 35));
    }

    #[test]
    fn region_full_and_update() {
        let mut keys = vec![0u32; 2];
        let mut vals = vec![0u64; 2];

        region_insert(&mut keys, &mut vals, 1, 10);
        region_insert(&mut keys, &mut vals, 2, 20);

        assert_eq!(RegionInsert::Full, region_insert(&mut keys, &mut vals, 3, 30));
        assert_eq!(
            RegionInsert::Updated(10),
            region_insert(&mut keys, &mut vals, 1, 11),
        );
    }

    #[test]
    fn region_remove_zeroes_tail() {
        let mut keys = vec![0u32; 4];
        let mut vals = vec![0u64; 4];

        region_insert(&mut keys, &mut vals, 1, 10);
        region_insert(&mut keys, &mut vals, 2, 20);
        region_insert(&mut keys, &mut vals, 3, 30);

        assert_eq!(Some(20), region_remove(&mut keys, &mut vals, 2));
        assert_eq!(None, region_remove(&mut keys, &mut vals, 2));
        assert_eq!(vec![1, 3, 0, 0], keys);
        assert_eq!(0, vals[2]);
    }

    #[test]
    fn region_codec_roundtrip() -> crate::Result<()> {
        let mut keys = vec![0u32; 16];
        let mut vals = vec![0u64; 16];

        for fp in 1u32..=10 {
            region_insert(&mut keys, &mut vals, fp, u64::from(fp) * 100);
        }

        let mut raw = Vec::new();
        encode_region(&keys, &vals, &mut raw);
        assert_eq!(16 * 12, raw.len());

        let (decoded_keys, decoded_vals) = decode_region(&raw, 16)?;
        assert_eq!(keys, decoded_keys);
        assert_eq!(vals, decoded_vals);

        Ok(())
    }
}
