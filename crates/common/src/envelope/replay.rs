use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Default accepted clock skew for envelopes and signed requests
pub const DEFAULT_TOLERANCE_SECS: i64 = 30;

/// Where a timestamp falls relative to the tolerance window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Older than the window, by this much
    Stale(Duration),
    /// Further in the future than the window allows
    Future(Duration),
}

/// Classify `timestamp` against `now` with a symmetric `tolerance`
pub fn freshness(timestamp: DateTime<Utc>, now: DateTime<Utc>, tolerance: Duration) -> Freshness {
    let age = now - timestamp;
    if age > tolerance {
        Freshness::Stale(age)
    } else if -age > tolerance {
        Freshness::Future(-age)
    } else {
        Freshness::Fresh
    }
}

/// Remembers digests of accepted messages for as long as their timestamp
/// could still pass the freshness check, so an exact repeat inside the
/// window is refused.
#[derive(Debug)]
pub struct ReplayGuard {
    tolerance: Duration,
    seen: Mutex<HashMap<[u8; 32], DateTime<Utc>>>,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TOLERANCE_SECS))
    }
}

impl ReplayGuard {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Record `message` (timestamped `timestamp`). Returns false if it was
    /// already seen.
    pub fn check_and_record(&self, message: &[u8], timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let digest = *blake3::hash(message).as_bytes();
        let mut seen = self.seen.lock();

        // anything older than this fails the freshness check anyway
        let horizon = now - self.tolerance;
        seen.retain(|_, at| *at >= horizon);

        if seen.contains_key(&digest) {
            return false;
        }
        seen.insert(digest, timestamp);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let tolerance = Duration::seconds(30);
        assert_eq!(freshness(now, now, tolerance), Freshness::Fresh);
        assert_eq!(
            freshness(now - Duration::seconds(30), now, tolerance),
            Freshness::Fresh
        );
        assert!(matches!(
            freshness(now - Duration::seconds(31), now, tolerance),
            Freshness::Stale(_)
        ));
        assert!(matches!(
            freshness(now + Duration::seconds(45), now, tolerance),
            Freshness::Future(_)
        ));
    }

    #[test]
    fn test_repeat_refused_then_forgotten() {
        let guard = ReplayGuard::new(Duration::seconds(30));
        let now = Utc::now();
        assert!(guard.check_and_record(b"hello", now, now));
        assert!(!guard.check_and_record(b"hello", now, now + Duration::seconds(5)));
        assert!(guard.check_and_record(b"other", now, now));
        assert_eq!(guard.len(), 2);

        // once outside the window the entry is pruned
        assert!(guard.check_and_record(b"late", now + Duration::seconds(61), now + Duration::seconds(61)));
        assert_eq!(guard.len(), 1);
    }
}
