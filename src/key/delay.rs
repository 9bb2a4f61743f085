//! Deferred key deactivation
//!
//! At most one pending timer per user: re-arming cancels the previous
//! timer under the registry mutex, and the timer thread re-checks its
//! cancelled flag under the task mutex before doing any kernel work.
//! A stale timer must never deactivate a key that was re-activated in
//! the meantime. Plain blocking thread plus condvar timeout; this
//! daemon has no async runtime.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

struct PendingTask {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl PendingTask {
    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
pub struct DelayHandler {
    pending: Arc<Mutex<HashMap<u32, Arc<PendingTask>>>>,
}

impl DelayHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deferred task for `user_id`, cancelling any previous one.
    pub fn defer(&self, user_id: u32, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let pending = Arc::new(PendingTask {
            cancelled: Mutex::new(false),
            cv: Condvar::new(),
        });
        let previous = self.pending.lock().insert(user_id, pending.clone());
        if let Some(previous) = previous {
            debug!(user_id, "re-armed deferred deactivation");
            previous.cancel();
        }

        let registry = self.pending.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + delay;
            let mut cancelled = pending.cancelled.lock();
            while !*cancelled {
                if pending.cv.wait_until(&mut cancelled, deadline).timed_out() {
                    break;
                }
            }
            // Cancellation is a flag check at execution time, under the
            // same mutex cancel() writes through.
            if *cancelled {
                return;
            }
            drop(cancelled);

            let mut map = registry.lock();
            if map
                .get(&user_id)
                .is_some_and(|current| Arc::ptr_eq(current, &pending))
            {
                map.remove(&user_id);
            }
            drop(map);
            task();
        });
    }

    /// Cancel the pending task for `user_id`, if any. Returns whether
    /// one was armed.
    pub fn cancel(&self, user_id: u32) -> bool {
        match self.pending.lock().remove(&user_id) {
            Some(task) => {
                task.cancel();
                debug!(user_id, "cancelled deferred deactivation");
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for DelayHandler {
    fn drop(&mut self) {
        for task in self.pending.lock().values() {
            task.cancel();
        }
    }
}
