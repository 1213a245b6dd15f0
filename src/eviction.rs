// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::cache::CacheInner;
use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// Handle of the background eviction worker.
///
/// The worker periodically checks DRAM usage against capacity and, at the
/// high watermark, runs the second-chance clock scan that migrates cold
/// leaves into the SSD tier. Worker errors are recorded in statistics and
/// never surface to callers.
pub(crate) struct EvictionHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

pub(crate) fn spawn(inner: Arc<CacheInner>, interval: Duration) -> EvictionHandle {
    let stop = Arc::new((Mutex::new(false), Condvar::new()));

    let thread = {
        let stop = Arc::clone(&stop);

        std::thread::spawn(move || {
            let (flag, signal) = &*stop;

            loop {
                {
                    let mut stopped = flag.lock().expect("lock is poisoned");

                    while !*stopped {
                        let (guard, timeout) = signal
                            .wait_timeout(stopped, interval)
                            .expect("lock is poisoned");
                        stopped = guard;

                        if timeout.timed_out() {
                            break;
                        }
                    }

                    if *stopped {
                        break;
                    }
                }

                if let Err(e) = inner.maybe_evict() {
                    inner.note_eviction_failure();
                    log::error!("Eviction pass failed: {e:?}");
                }
            }

            log::trace!("Eviction worker shutting down");
        })
    };

    EvictionHandle {
        stop,
        thread: Some(thread),
    }
}

impl EvictionHandle {
    pub fn stop(mut self) {
        {
            let (flag, signal) = &*self.stop;
            *flag.lock().expect("lock is poisoned") = true;
            signal.notify_all();
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Eviction worker panicked");
            }
        }
    }
}
