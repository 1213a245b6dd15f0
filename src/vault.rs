// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Mutex,
};

struct VaultInner {
    slots: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
}

/// In-memory home for tiny/medium payload bytes.
///
/// The index tiers store fixed-width value words; for DRAM-resident
/// objects that word is a handle into this slab. Handles stay valid until
/// released through the DRAM tree's value-reclaim hook.
pub(crate) struct Vault {
    inner: Mutex<VaultInner>,
    bytes: AtomicU64,
}

impl Vault {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VaultInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            bytes: AtomicU64::new(0),
        }
    }

    /// Stores a payload, returning its handle.
    pub fn insert(&self, payload: &[u8]) -> u64 {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let boxed: Box<[u8]> = payload.into();

        self.bytes.fetch_add(boxed.len() as u64, Relaxed);

        let idx = if let Some(idx) = inner.free.pop() {
            if let Some(slot) = inner.slots.get_mut(idx) {
                *slot = Some(boxed);
            }
            idx
        } else {
            inner.slots.push(Some(boxed));
            inner.slots.len() - 1
        };

        idx as u64
    }

    /// Copies out the payload behind a handle.
    pub fn get(&self, handle: u64) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("lock is poisoned");

        inner
            .slots
            .get(usize::try_from(handle).ok()?)
            .and_then(|slot| slot.as_ref().map(|payload| payload.to_vec()))
    }

    /// Releases a handle. Invalid or already-released handles (including
    /// the tombstone word) are ignored.
    pub fn release(&self, handle: u64) {
        let Ok(idx) = usize::try_from(handle) else {
            return;
        };

        let mut inner = self.inner.lock().expect("lock is poisoned");

        let Some(slot) = inner.slots.get_mut(idx) else {
            return;
        };

        if let Some(payload) = slot.take() {
            self.bytes.fetch_sub(payload.len() as u64, Relaxed);
            inner.free.push(idx);
        }
    }

    /// Bytes of live payloads.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Relaxed)
    }
}
