// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

struct QueueState {
    items: VecDeque<usize>,
    shutdown: bool,
}

/// Work queue feeding the background flush worker.
///
/// Items are DRAM leaf node IDs whose write buffer crossed the flush
/// threshold. On shutdown the queue keeps handing out pending items until
/// it is drained, so no staged operation is dropped.
pub(crate) struct FlushQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            signal: Condvar::new(),
        }
    }

    pub fn enqueue(&self, node_id: usize) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.items.push_back(node_id);
        drop(state);

        self.signal.notify_one();
    }

    /// Blocks until an item is available.
    ///
    /// Returns `None` once the queue was shut down and fully drained.
    pub fn next(&self) -> Option<usize> {
        let mut state = self.state.lock().expect("lock is poisoned");

        loop {
            if let Some(id) = state.items.pop_front() {
                return Some(id);
            }

            if state.shutdown {
                return None;
            }

            state = self.signal.wait(state).expect("lock is poisoned");
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.shutdown = true;
        drop(state);

        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn flush_queue_drains_before_shutdown() {
        let queue = Arc::new(FlushQueue::new());

        queue.enqueue(1);
        queue.enqueue(2);
        queue.shutdown();

        // Pending items survive shutdown and drain in order
        assert_eq!(Some(1), queue.next());
        assert_eq!(Some(2), queue.next());
        assert_eq!(None, queue.next());
    }

    #[test]
    fn flush_queue_wakes_waiter() {
        let queue = Arc::new(FlushQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.enqueue(7);

        assert_eq!(Some(7), consumer.join().expect("thread panicked"));
    }
}
