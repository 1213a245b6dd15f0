// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A multi-tier key/value cache mixing in-memory compressed indexes,
//! pointer indirection for large objects, and an on-SSD B+tree whose
//! leaves are composed of independently compressible 4 KiB sub-pages.
//!
//! ##### About
//!
//! Compression favors coarse granularity, point access favors fine
//! granularity. This crate resolves the tension by hashing each key to
//! exactly one 4 KiB sub-page within its leaf (a lookup touches a single
//! block), buffering writes per leaf to amortize compression, and routing
//! objects by size to the tier best suited to them:
//!
//! - tiny and medium values live behind the DRAM compressed B+tree,
//! - large values go to an append-only SSD object store, indexed by
//!   checksummed descriptors,
//! - cold DRAM leaves migrate into an on-SSD B+tree of 16-sub-page
//!   super-leaves.
//!
//! Keys are opaque byte strings up to 256 bytes; every tier indexes their
//! 32-bit fingerprint, so all tiers agree on ordering and sub-page
//! routing. The surface is point access only (no range scans), and crash
//! recovery is out of scope: clean shutdown flushes and syncs, an
//! ungraceful exit may leave unreferenced blocks behind.
//!
//! # Example usage
//!
//! ```
//! use zipcache::Config;
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! // A cache is three tiers behind one point-access API
//! let cache = Config::new(dir.path().join("demo")).open()?;
//!
//! cache.put(b"small", &[0x41; 64])?;
//! cache.put(b"large", &vec![0x42; 8_192])?;
//!
//! assert_eq!(Some(vec![0x41; 64]), cache.get(b"small")?);
//! assert_eq!(Some(vec![0x42; 8_192]), cache.get(b"large")?);
//!
//! assert!(cache.delete(b"small")?);
//! assert_eq!(None, cache.get(b"small")?);
//!
//! let stats = cache.stats();
//! assert_eq!(1, stats.puts_tiny);
//! assert_eq!(1, stats.puts_large);
//! #
//! # Ok::<(), zipcache::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![warn(clippy::multiple_crate_versions)]

mod binary_search;
mod block_allocator;
mod cache;
mod checksum;
mod compression;
mod config;
mod dram;
mod error;
mod eviction;
mod file;
mod fingerprint;
mod large_object;
mod object_store;
mod ssd_tree;
mod stats;
mod subpage;
mod superleaf;
mod vault;

pub use {
    block_allocator::{BlockAllocator, BlockId, INVALID_BLOCK},
    cache::{ZipCache, MAX_KEY_SIZE, MAX_VALUE_SIZE},
    checksum::Checksum,
    compression::{CompressionType, ACCEL_MAX_LEVEL},
    config::Config,
    dram::{DramOptions, DramTree, TOMBSTONE},
    error::{Error, Result},
    file::{BlockFile, BLOCK_SIZE},
    fingerprint::{fingerprint, sub_page_slot, ZERO_FP_SUBSTITUTE},
    large_object::{LargeObjectTree, ObjectDescriptor, BPLUS_MAX_ENTRIES},
    object_store::ObjectStore,
    ssd_tree::{SsdTree, DEFAULT_SSD_ORDER},
    stats::StatsSnapshot,
    subpage::{SubPage, SubPageInsert, SUB_PAGE_CAP, SUB_PAGE_HEADER_SIZE},
    superleaf::{LeafInsert, SuperLeaf, SPLIT_WATERMARK, SUB_PAGES_PER_LEAF},
};
