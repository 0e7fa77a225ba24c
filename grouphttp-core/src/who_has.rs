//! Pending physical-address lookups. An entry suppresses repeated lookups for the
//! same node until it expires.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default lifetime of a pending lookup.
pub const DEFAULT_WHO_HAS_TIMEOUT: Duration = Duration::from_millis(2000);

/// Set whose entries expire `ttl` after insertion. The host passes the current time.
#[derive(Debug, Clone)]
pub struct ExpiringSet<T> {
    ttl: Duration,
    entries: HashMap<T, Instant>,
}

impl<T: Eq + Hash + Clone> ExpiringSet<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert unless a live entry exists. Returns true if inserted (caller should start a lookup).
    pub fn add_if_absent(&mut self, key: T, now: Instant) -> bool {
        match self.entries.get(&key) {
            Some(&at) if now.saturating_duration_since(at) < self.ttl => false,
            _ => {
                self.entries.insert(key, now);
                true
            }
        }
    }

    pub fn contains(&self, key: &T, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|&at| now.saturating_duration_since(at) < self.ttl)
    }

    pub fn remove(&mut self, key: &T) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop expired entries.
    pub fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_entry_blocks_second_lookup() {
        let t0 = Instant::now();
        let mut set = ExpiringSet::new(Duration::from_millis(100));
        assert!(set.add_if_absent("a", t0));
        assert!(!set.add_if_absent("a", t0 + Duration::from_millis(50)));
        assert!(set.contains(&"a", t0 + Duration::from_millis(99)));
    }

    #[test]
    fn expired_entry_allows_lookup() {
        let t0 = Instant::now();
        let mut set = ExpiringSet::new(Duration::from_millis(100));
        set.add_if_absent("a", t0);
        let later = t0 + Duration::from_millis(100);
        assert!(!set.contains(&"a", later));
        assert!(set.add_if_absent("a", later));
    }

    #[test]
    fn purge_drops_expired() {
        let t0 = Instant::now();
        let mut set = ExpiringSet::new(DEFAULT_WHO_HAS_TIMEOUT);
        set.add_if_absent(1, t0);
        set.add_if_absent(2, t0 + Duration::from_millis(1500));
        set.purge(t0 + Duration::from_millis(2500));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&2, t0 + Duration::from_millis(2500)));
        assert!(set.remove(&2));
        assert!(set.is_empty());
    }
}
