use std::sync::Mutex;
use test_log::test;
use zipcache::{
    sub_page_slot, BlockAllocator, BlockFile, LeafInsert, SsdTree, SuperLeaf, SPLIT_WATERMARK,
    SUB_PAGES_PER_LEAF,
};

const LEAF_CAPACITY: usize = SUB_PAGES_PER_LEAF * zipcache::SUB_PAGE_CAP;

/// Fills the leaf to the split watermark with uniformly hashed keys, then
/// overfills one sub-page until the leaf signals the split.
fn provoke_split(
    dev: &BlockFile,
    alloc: &Mutex<BlockAllocator>,
    leaf: &mut SuperLeaf,
) -> zipcache::Result<u32> {
    for fp in 1u32..=SPLIT_WATERMARK as u32 {
        assert_eq!(LeafInsert::Inserted, leaf.insert(dev, alloc, fp, u64::from(fp))?);
    }

    assert!(leaf.is_split_due());

    // Keep hammering one slot until its sub-page runs out of room
    let mut fp = SPLIT_WATERMARK as u32 + 1;

    loop {
        match leaf.insert(dev, alloc, fp, u64::from(fp))? {
            LeafInsert::NeedsSplit => return Ok(fp),
            LeafInsert::Inserted | LeafInsert::Updated(_) => fp += 16,
        }
    }
}

#[test]
fn split_signal_and_redistribution() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let dev = BlockFile::open(&dir.path().join("leaves"), 256)?;
    let alloc = Mutex::new(BlockAllocator::new(256));

    let mut leaf = SuperLeaf::new();
    let pending = provoke_split(&dev, &alloc, &mut leaf)?;
    let before = leaf.total_entries();

    let (median, mut right) = leaf.split(&dev, &alloc)?;

    // Both siblings end up below 50 % of leaf capacity
    assert!(leaf.total_entries() < LEAF_CAPACITY / 2);
    assert!(right.total_entries() < LEAF_CAPACITY / 2);
    assert_eq!(before, leaf.total_entries() + right.total_entries());

    // The pending insert now succeeds on its side
    let side = if pending < median { &mut leaf } else { &mut right };
    assert_eq!(
        LeafInsert::Inserted,
        side.insert(&dev, &alloc, pending, u64::from(pending))?,
    );
    assert_eq!(before + 1, leaf.total_entries() + right.total_entries());

    Ok(())
}

#[test]
fn split_through_the_tree() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let tree = SsdTree::open(&dir.path().join("tree.ssd"), 4_096, 64)?;

    // 90 % fill with uniformly hashed keys
    for fp in 1u32..=SPLIT_WATERMARK as u32 {
        tree.insert(fp, u64::from(fp))?;
    }
    assert_eq!(1, tree.leaf_entry_counts().len());

    // Overfill one sub-page slot; the tree splits the leaf on its own
    let mut fp = SPLIT_WATERMARK as u32 + 1;
    let mut inserted = vec![];

    while tree.leaf_entry_counts().len() == 1 {
        tree.insert(fp, u64::from(fp))?;
        inserted.push(fp);
        fp += 16;
    }

    let counts = tree.leaf_entry_counts();
    assert_eq!(2, counts.len());

    // Sum of the two siblings is the pre-split population plus the
    // pending insert
    let total: usize = counts.iter().sum();
    assert_eq!(SPLIT_WATERMARK + inserted.len(), total);

    // Both siblings sit below half capacity
    assert!(counts.iter().all(|&count| count < LEAF_CAPACITY / 2));

    // The promoted separator landed in the leaf-parent
    let separators = tree.leaf_parent_separators();
    assert_eq!(1, separators.len());

    // Every key is still reachable
    for fp in (1u32..=SPLIT_WATERMARK as u32).chain(inserted.iter().copied()) {
        assert_eq!(Some(u64::from(fp)), tree.get(fp)?, "fingerprint {fp}");
    }

    Ok(())
}

#[test]
fn split_preserves_hash_routing() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let tree = SsdTree::open(&dir.path().join("tree.ssd"), 4_096, 64)?;

    for fp in 1u32..=(SPLIT_WATERMARK as u32 + 600) {
        tree.insert(fp, u64::from(fp))?;
    }

    assert!(tree.leaf_entry_counts().len() > 1);

    // Every key resides in slot hash(fp) mod 16 of its owning sibling
    assert!(tree.verify_slot_routing()?);

    // No block is referenced twice and all referenced blocks are
    // allocated
    assert!(tree.verify_block_integrity()?);

    // Sibling links survived the splits
    assert!(tree.verify_sibling_links());

    // Routing function itself is stable across tiers and time
    for fp in [1u32, 77, 4_096, 100_000] {
        assert_eq!(sub_page_slot(fp, 16), sub_page_slot(fp, 16));
    }

    Ok(())
}
