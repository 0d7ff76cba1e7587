//! Run-until-cancelled primitive for drivers that must stay alive while
//! native callbacks keep arriving.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clonable cancellation flag; every clone observes the same signal.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (cancelled, changed) = &*self.inner;
        *cancelled.lock() = true;
        changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until cancelled
    pub fn wait(&self) {
        let (cancelled, changed) = &*self.inner;
        let mut flag = cancelled.lock();
        while !*flag {
            changed.wait(&mut flag);
        }
    }

    /// Block until cancelled or `timeout` elapses; returns whether cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (cancelled, changed) = &*self.inner;
        let mut flag = cancelled.lock();
        while !*flag {
            if changed.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        *flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_timeout_without_cancel() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        signal.cancel();
        waiter.join().unwrap();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
    }
}
