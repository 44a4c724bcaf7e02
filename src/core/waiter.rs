//! Per-request notification primitive.
//!
//! A [`Waiter`] pairs each request's growing output buffer with a signal the
//! consumer can block on. The producer (the scheduling loop) calls
//! [`Waiter::notify`] after appending a token or marking the request
//! terminal; consumers sample the epoch, inspect the guarded state, and only
//! then wait, so a notification is never lost.

use parking_lot::{Condvar, Mutex};

/// Single-slot notification signal with an epoch counter.
#[derive(Debug, Default)]
pub struct Waiter {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Waiter {
    /// Create a new waiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch. Sample this before inspecting the state the waiter
    /// guards, then pass it to [`wait`](Self::wait).
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Signal that guarded state changed. Wakes every waiting consumer.
    pub fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.cond.notify_all();
    }

    /// Block until the epoch moves past `seen`, then return the new epoch.
    ///
    /// Returns immediately if a notify already happened since `seen` was
    /// sampled.
    pub fn wait(&self, seen: u64) -> u64 {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            self.cond.wait(&mut epoch);
        }
        *epoch
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_notify_bumps_epoch() {
        let waiter = Waiter::new();
        let before = waiter.epoch();
        waiter.notify();
        assert_eq!(waiter.epoch(), before + 1);
    }

    #[test]
    fn test_wait_returns_after_notify() {
        let waiter = Arc::new(Waiter::new());
        let seen = waiter.epoch();

        let producer = {
            let waiter = waiter.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                waiter.notify();
            })
        };

        let new_epoch = waiter.wait(seen);
        assert!(new_epoch > seen);
        producer.join().unwrap();
    }

    #[test]
    fn test_wait_does_not_block_on_stale_epoch() {
        let waiter = Waiter::new();
        let seen = waiter.epoch();
        waiter.notify();
        // Notify already happened; wait must return without another one.
        assert!(waiter.wait(seen) > seen);
    }
}
