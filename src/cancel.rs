// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{aborted_error, CanonicalError};

/// Shared cancel flag. Clones observe the same flag. Waiters blocked in
/// sleep() are woken as soon as cancel() is called.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Sets the flag. Returns true only for the call that actually changed
    /// it, so repeated calls are harmless.
    pub fn cancel(&self) -> bool {
        let (flag, condvar) = &*self.inner;
        let mut locked_flag = flag.lock().unwrap();
        let first = !*locked_flag;
        *locked_flag = true;
        condvar.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Clears the flag for the next run.
    pub fn reset(&self) {
        *self.inner.0.lock().unwrap() = false;
    }

    /// Returns an Aborted error if cancelled.
    pub fn check(&self, what: &str) -> Result<(), CanonicalError> {
        if self.is_cancelled() {
            return Err(aborted_error(format!("Cancelled during {}", what).as_str()));
        }
        Ok(())
    }

    /// Sleeps for `duration` or until cancelled. Returns true if the sleep was
    /// cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (flag, condvar) = &*self.inner;
        let mut locked_flag = flag.lock().unwrap();
        loop {
            if *locked_flag {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            locked_flag = condvar.wait_timeout(locked_flag, deadline - now).unwrap().0;
        }
    }

    /// Polls `condition` every `interval` until it returns true, the deadline
    /// passes, or the token is cancelled.
    pub fn wait_until<F>(&self, interval: Duration, timeout: Duration,
                         mut condition: F) -> WaitOutcome
    where F: FnMut() -> bool
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return WaitOutcome::Satisfied;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            if self.sleep(interval) {
                return WaitOutcome::Cancelled;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use std::thread;

    use canonical_error::CanonicalErrorCode;

    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check("test").is_ok());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.check("test").unwrap_err().code,
                   CanonicalErrorCode::Aborted);
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let cloned = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cloned.cancel();
        });
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_until() {
        let token = CancelToken::new();
        let mut count = 0;
        let outcome = token.wait_until(Duration::from_millis(1),
                                       Duration::from_secs(5),
                                       || { count += 1; count >= 3 });
        assert_eq!(outcome, WaitOutcome::Satisfied);

        let outcome = token.wait_until(Duration::from_millis(5),
                                       Duration::from_millis(20), || false);
        assert_eq!(outcome, WaitOutcome::TimedOut);

        token.cancel();
        let outcome = token.wait_until(Duration::from_millis(5),
                                       Duration::from_secs(5), || false);
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }
}
