//! Sliding-window rate limiter (spec §4.2). Used in two per-connection
//! configurations: the global message limiter (100/1s) and the LLM
//! submission limiter (30/60s).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A timestamped list of admitted requests. `check()` prunes entries older
/// than `window`, denies if the remaining count equals `max`, otherwise
/// admits and records `now`.
pub struct SlidingWindowRateLimiter {
    max: u32,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindowRateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            admitted: VecDeque::new(),
        }
    }

    /// `check()` from spec §4.2.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        let window = self.window;
        while matches!(self.admitted.front(), Some(t) if now.duration_since(*t) > window) {
            self.admitted.pop_front();
        }
        if self.admitted.len() as u32 >= self.max {
            return false;
        }
        self.admitted.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_denies() {
        let mut rl = SlidingWindowRateLimiter::new(2, Duration::from_millis(1000));
        assert!(rl.check());
        assert!(rl.check());
        assert!(!rl.check());
    }

    #[test]
    fn admits_again_after_window_elapses() {
        let mut rl = SlidingWindowRateLimiter::new(2, Duration::from_millis(50));
        assert!(rl.check());
        assert!(rl.check());
        assert!(!rl.check());
        std::thread::sleep(Duration::from_millis(60));
        assert!(rl.check());
    }

    #[test]
    fn only_expired_entries_are_pruned() {
        let mut rl = SlidingWindowRateLimiter::new(1, Duration::from_millis(30));
        assert!(rl.check());
        std::thread::sleep(Duration::from_millis(40));
        // the single admitted entry has aged out; a fresh one is allowed.
        assert!(rl.check());
        assert!(!rl.check());
    }
}
