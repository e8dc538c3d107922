// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Shared stop request for a worker loop.
///
/// Clones observe the same request, so a signal handler thread and the
/// loop can each hold one.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        let (lock, _) = &*self.state;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the sleep was cut short by a shutdown request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (lock, cvar) = &*self.state;
        let mut requested = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*requested {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            requested = cvar
                .wait_timeout(requested, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sleep_runs_full_duration() {
        let token = ShutdownToken::new();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_request_wakes_sleeper() {
        let token = ShutdownToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let interrupted = token.sleep(Duration::from_secs(30));
                (interrupted, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        token.request();

        let (interrupted, slept) = sleeper.join().unwrap();
        assert!(interrupted);
        assert!(slept < Duration::from_secs(5));
        assert!(token.is_requested());
    }

    #[test]
    fn test_sleep_after_request_returns_immediately() {
        let token = ShutdownToken::new();
        token.request();
        assert!(token.sleep(Duration::from_secs(30)));
    }
}
