// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The free-id allocator: a bounded pool of 16-bit transaction ids handed
//! out deterministically (smallest first) with blocking `get`/waking `put`,
//! the way a bounded resource pool with backpressure is commonly built on
//! an async runtime (c.f. the token-bucket style waiter pattern in
//! `erbium`'s rate limiter, generalized here to a min-heap of free ids
//! instead of a token count).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Ids are drawn from `1..=512`, bounding how many requests can be
/// in flight against one upstream at once.
pub const MAX_ID: u16 = 512;

struct State {
    free: BinaryHeap<Reverse<u16>>,
}

/// Pool of available upstream-scoped transaction ids for one upstream
/// client.
pub struct IdPool {
    state: Mutex<State>,
    notify: Notify,
}

impl IdPool {
    pub fn new() -> Self {
        let free = (1..=MAX_ID).map(Reverse).collect();
        Self {
            state: Mutex::new(State { free }),
            notify: Notify::new(),
        }
    }

    /// Removes and returns the smallest available id, suspending until one
    /// is available if the pool is currently exhausted.
    pub async fn get(&self) -> u16 {
        loop {
            // Register for a wakeup *before* checking, so a `put` that races
            // with us after we see an empty pool still wakes us instead of
            // being lost.
            let notified = self.notify.notified();

            if let Some(id) = self.try_get() {
                return id;
            }

            notified.await;
        }
    }

    fn try_get(&self) -> Option<u16> {
        let mut state = self.state.lock().expect("id pool mutex poisoned");
        state.free.pop().map(|Reverse(id)| id)
    }

    /// Returns `id` to the pool and wakes one waiter. Inserting an id
    /// already present is a programmer error and panics rather than
    /// silently corrupting the pool.
    pub fn put(&self, id: u16) {
        {
            let mut state = self.state.lock().expect("id pool mutex poisoned");
            if state.free.iter().any(|Reverse(existing)| *existing == id) {
                panic!("dnsfwd-proto: double free of transaction id {id}");
            }
            state.free.push(Reverse(id));
        }
        self.notify.notify_one();
    }

    /// Current count of available ids; used by tests to assert property 3
    /// (id reclamation) and by callers wanting to report pool pressure via
    /// the metrics hook.
    pub fn available(&self) -> usize {
        self.state.lock().expect("id pool mutex poisoned").free.len()
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}
