//! Event waiter: the one place a controller thread blocks.
//!
//! Controllers sleep here with a bounded timeout when a pass makes no
//! progress. Anything that could create work (a new entity, a connection
//! becoming readable or writable) calls `event_occurred` to cut the sleep
//! short. An event fired while nobody is waiting is remembered, so the next
//! wait returns immediately.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct EventWaiter {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl EventWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiting thread, or pre-arm the next wait.
    pub fn event_occurred(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cond.notify_one();
    }

    /// Block for at most `timeout`. Returns true if an event ended the wait.
    pub fn wait_for_event(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            let _ = self.cond.wait_for(&mut fired, timeout);
        }
        let woken = *fired;
        *fired = false;
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn times_out_without_event() {
        let waiter = EventWaiter::new();
        let start = Instant::now();
        assert!(!waiter.wait_for_event(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn pre_armed_event_returns_immediately() {
        let waiter = EventWaiter::new();
        waiter.event_occurred();
        assert!(waiter.wait_for_event(Duration::from_secs(5)));
        // Consumed: the next wait times out.
        assert!(!waiter.wait_for_event(Duration::from_millis(1)));
    }

    #[test]
    fn wakes_from_another_thread() {
        let waiter = Arc::new(EventWaiter::new());
        let w = waiter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            w.event_occurred();
        });
        assert!(waiter.wait_for_event(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
