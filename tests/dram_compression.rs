use test_log::test;
use zipcache::{DramOptions, DramTree};

#[test]
fn dram_bulk_load_compresses() -> zipcache::Result<()> {
    let tree = DramTree::new(DramOptions {
        num_sub_pages: 16,
        flush_threshold: 10,
        ..DramOptions::default()
    })?;

    let count = 100_000u32;

    for fp in 1..=count {
        tree.insert(fp, u64::from(fp).wrapping_mul(0x9E37_79B9))?;
    }

    tree.flush_all()?;

    // The compressed images beat the raw slot arrays
    assert!(tree.compressed_bytes() > 0);
    assert!(
        tree.compressed_bytes() < tree.uncompressed_bytes(),
        "compressed {} vs uncompressed {}",
        tree.compressed_bytes(),
        tree.uncompressed_bytes(),
    );

    // Random point reads decompress a single sub-page each
    let mut fp = 12_345u32;

    for _ in 0..1_000 {
        fp = fp.wrapping_mul(1_664_525).wrapping_add(1_013_904_223) % count + 1;
        assert_eq!(
            Some(u64::from(fp).wrapping_mul(0x9E37_79B9)),
            tree.get(fp)?,
            "fingerprint {fp}",
        );
    }

    Ok(())
}

#[test]
fn dram_accel_codec_roundtrip() -> zipcache::Result<()> {
    let tree = DramTree::new(DramOptions {
        compression: zipcache::CompressionType::Accel(6),
        flush_threshold: 10,
        ..DramOptions::default()
    })?;

    for fp in 1u32..=20_000 {
        tree.insert(fp, u64::from(fp))?;
    }

    tree.flush_all()?;

    assert!(tree.compressed_bytes() < tree.uncompressed_bytes());

    for fp in [1u32, 5_000, 19_999] {
        assert_eq!(Some(u64::from(fp)), tree.get(fp)?);
    }

    Ok(())
}

#[test]
fn dram_deletes_after_flush() -> zipcache::Result<()> {
    let tree = DramTree::new(DramOptions {
        flush_threshold: 10,
        ..DramOptions::default()
    })?;

    for fp in 1u32..=10_000 {
        tree.insert(fp, u64::from(fp))?;
    }

    tree.flush_all()?;

    for fp in (1u32..=10_000).step_by(2) {
        tree.delete(fp)?;
    }

    tree.flush_all()?;

    for fp in 1u32..=10_000 {
        let expected = if fp % 2 == 0 { Some(u64::from(fp)) } else { None };
        assert_eq!(expected, tree.get(fp)?, "fingerprint {fp}");
    }

    assert_eq!(5_000, tree.len());

    Ok(())
}
