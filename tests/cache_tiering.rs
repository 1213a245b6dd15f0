use test_log::test;
use zipcache::{Config, ZipCache};

fn open_cache(dir: &tempfile::TempDir) -> zipcache::Result<ZipCache> {
    Config::new(dir.path().join("cache"))
        .total_blocks(4_096)
        .open()
}

#[test]
fn tiering_small_then_small() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    cache.put(b"a", &[0x41; 64])?;
    cache.put(b"b", &[0x42; 64])?;

    assert_eq!(Some(vec![0x41; 64]), cache.get(b"a")?);
    assert_eq!(Some(vec![0x42; 64]), cache.get(b"b")?);

    let stats = cache.stats();
    assert_eq!(2, stats.puts_tiny);
    assert_eq!(2, stats.hits_dram);
    assert_eq!(0, stats.misses);

    Ok(())
}

#[test]
fn tiering_small_then_large() -> zipcache::Result<()> {
    use rand::RngCore;

    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    cache.put(b"k", &[7u8; 32])?;

    let mut payload = vec![0u8; 4_096];
    rand::rng().fill_bytes(&mut payload);
    cache.put(b"k", &payload)?;

    assert_eq!(Some(payload), cache.get(b"k")?);

    let stats = cache.stats();
    assert_eq!(1, stats.puts_tiny);
    assert_eq!(1, stats.puts_large);
    assert_eq!(1, stats.tombstones);

    // Exactly one descriptor for the key
    assert_eq!(1, stats.large_objects);
    assert_eq!(1, stats.hits_large);

    Ok(())
}

#[test]
fn tiering_large_then_small_invalidates_descriptor() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    cache.put(b"k", &vec![0xCC; 10_000])?;
    assert_eq!(1, cache.stats().large_objects);

    cache.put(b"k", b"now small")?;

    assert_eq!(Some(b"now small".to_vec()), cache.get(b"k")?);
    assert_eq!(0, cache.stats().large_objects);

    Ok(())
}

#[test]
fn tiering_delete_then_get() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    cache.put(b"x", &[1u8; 100])?;
    assert!(cache.delete(b"x")?);
    assert_eq!(None, cache.get(b"x")?);

    // Idempotent on absent keys
    assert!(!cache.delete(b"x")?);

    Ok(())
}

#[test]
fn tiering_delete_large() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    cache.put(b"big", &vec![0x55; 50_000])?;
    assert!(cache.delete(b"big")?);
    assert_eq!(None, cache.get(b"big")?);
    assert_eq!(0, cache.stats().large_objects);

    Ok(())
}

#[test]
fn tiering_thresholds() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    assert_eq!((128, 2_048), cache.get_thresholds());

    cache.set_thresholds(64, 1_024)?;
    assert_eq!((64, 1_024), cache.get_thresholds());

    // 100 bytes now classifies as medium
    cache.put(b"k", &[9u8; 100])?;
    assert_eq!(1, cache.stats().puts_medium);

    assert!(cache.set_thresholds(0, 1_024).is_err());
    assert!(cache.set_thresholds(1_024, 64).is_err());
    assert!(cache.set_thresholds(64, 64).is_err());

    Ok(())
}

#[test]
fn tiering_rejects_bad_sizes() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    assert!(matches!(
        cache.put(b"empty", b""),
        Err(zipcache::Error::InvalidValueSize(0))
    ));

    let oversized = vec![0u8; zipcache::MAX_VALUE_SIZE as usize + 1];
    assert!(matches!(
        cache.put(b"huge", &oversized),
        Err(zipcache::Error::InvalidValueSize(_))
    ));

    let long_key = vec![b'k'; zipcache::MAX_KEY_SIZE + 1];
    assert!(matches!(
        cache.put(&long_key, b"v"),
        Err(zipcache::Error::KeyTooLong(_))
    ));

    Ok(())
}

#[test]
fn tiering_range_is_unsupported() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    assert!(matches!(
        cache.range(b"a", b"z"),
        Err(zipcache::Error::Unsupported("range scans"))
    ));

    Ok(())
}

#[test]
fn tiering_flush_and_reread() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    for i in 0u32..500 {
        cache.put(format!("key_{i}").as_bytes(), format!("value_{i}").as_bytes())?;
    }

    cache.flush()?;

    for i in 0u32..500 {
        assert_eq!(
            Some(format!("value_{i}").into_bytes()),
            cache.get(format!("key_{i}").as_bytes())?,
        );
    }

    Ok(())
}

#[test]
fn tiering_concurrent_smoke() -> zipcache::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = open_cache(&dir)?;

    std::thread::scope(|s| {
        for t in 0u32..4 {
            let cache = &cache;

            s.spawn(move || {
                for i in 0u32..500 {
                    let key = format!("t{t}_k{i}");
                    cache.put(key.as_bytes(), key.as_bytes()).expect("put failed");

                    let got = cache.get(key.as_bytes()).expect("get failed");
                    assert_eq!(Some(key.clone().into_bytes()), got);
                }
            });
        }
    });

    for t in 0u32..4 {
        for i in 0u32..500 {
            let key = format!("t{t}_k{i}");
            assert_eq!(
                Some(key.clone().into_bytes()),
                cache.get(key.as_bytes())?,
            );
        }
    }

    Ok(())
}
