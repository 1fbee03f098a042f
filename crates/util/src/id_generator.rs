//! Wrapping 16-bit id generator.

use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

/// Process-wide generator handed out by [`IdGenerator::session_ids`].
static SESSION_IDS: LazyLock<Arc<IdGenerator>> = LazyLock::new(|| Arc::new(IdGenerator::new()));

/// Hands out 16-bit ids from a counter guarded by a mutex.
///
/// Every call increments the counter and returns the new value, so a fresh
/// generator starts at `1`. The counter wraps at 65536: after `u16::MAX` the
/// next id is `0`.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: Mutex<u16>,
}

impl IdGenerator {
    /// Creates a generator whose first id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Creates a generator whose first id is `last.wrapping_add(1)`.
    #[must_use]
    pub fn starting_after(last: u16) -> Self {
        Self {
            counter: Mutex::new(last),
        }
    }

    /// The generator shared by every session in the process unless a
    /// component is configured with its own.
    #[must_use]
    pub fn session_ids() -> Arc<Self> {
        Arc::clone(&SESSION_IDS)
    }

    /// Increments the counter and returns the new id.
    pub fn next_id(&self) -> u16 {
        let mut counter = self.counter.lock();
        *counter = counter.wrapping_add(1);
        *counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_ids_wrap_at_u16_max() {
        let ids = IdGenerator::starting_after(u16::MAX - 1);
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let ids = Arc::new(IdGenerator::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_session_ids_is_shared() {
        let a = IdGenerator::session_ids();
        let b = IdGenerator::session_ids();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
