//! Error log rate limiting.
//!
//! A dispatch loop that keeps failing on the same condition would otherwise
//! log on every iteration. The limiter lets one line per error kind through
//! per interval and reports how many were swallowed in between.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ErrorLogLimiter {
    interval: Duration,
    /// Last emitted time and suppressed count per error kind
    seen: HashMap<&'static str, (Instant, u64)>,
}

impl ErrorLogLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            seen: HashMap::new(),
        }
    }

    /// `Some(suppressed)` when an error of `kind` should be logged now.
    pub fn admit(&mut self, kind: &'static str) -> Option<u64> {
        self.admit_at(kind, Instant::now())
    }

    fn admit_at(&mut self, kind: &'static str, now: Instant) -> Option<u64> {
        match self.seen.get_mut(kind) {
            Some((last, suppressed)) if now.duration_since(*last) < self.interval => {
                *suppressed += 1;
                None
            }
            Some((last, suppressed)) => {
                let count = *suppressed;
                *last = now;
                *suppressed = 0;
                Some(count)
            }
            None => {
                self.seen.insert(kind, (now, 0));
                Some(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeats_are_suppressed_within_interval() {
        let mut limiter = ErrorLogLimiter::new(Duration::from_secs(5));
        let start = Instant::now();
        assert_eq!(limiter.admit_at("bus", start), Some(0));
        assert_eq!(limiter.admit_at("bus", start + Duration::from_secs(1)), None);
        assert_eq!(limiter.admit_at("bus", start + Duration::from_secs(2)), None);
        assert_eq!(limiter.admit_at("bus", start + Duration::from_secs(6)), Some(2));
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut limiter = ErrorLogLimiter::new(Duration::from_secs(5));
        assert_eq!(limiter.admit("bus"), Some(0));
        assert_eq!(limiter.admit("store"), Some(0));
        assert_eq!(limiter.admit("bus"), None);
    }
}
