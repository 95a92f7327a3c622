//! Interruptible sleeps shared by all background threads.
//!
//! Every long-running thread in a run (schedule managers, workers, scoreboard aggregators) paces
//! itself with timed sleeps. A [`StopSignal`] lets the owner cancel all of them at once: a stopped
//! signal wakes every sleeper immediately, and sleepers treat the wake-up as a request to exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A cloneable cancellation flag with interruptible sleeps.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl StopSignal {
    /// Creates a signal that is not stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal as stopped and wakes all sleepers.
    pub fn stop(&self) {
        *self.inner.stopped.lock() = true;
        self.inner.wakeup.notify_all();
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleeps for `duration`.
    ///
    /// Returns `false` if the signal was stopped before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }

    /// Sleeps until `deadline`.
    ///
    /// Returns `false` if the signal was stopped before or during the sleep.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            if self.inner.wakeup.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn sleeps_full_duration() {
        let signal = StopSignal::new();
        let start = Instant::now();

        assert!(signal.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn stop_interrupts_sleepers() {
        let signal = StopSignal::new();
        let sleeper = {
            let signal = signal.clone();
            thread::spawn(move || signal.sleep(Duration::from_secs(60)))
        };

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        signal.stop();

        assert!(!sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(signal.is_stopped());
    }

    #[test]
    fn stopped_signal_does_not_sleep() {
        let signal = StopSignal::new();
        signal.stop();

        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(60)));
        assert!(!signal.sleep_until(Instant::now() + Duration::from_secs(60)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
