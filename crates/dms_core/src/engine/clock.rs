//! Logical clock used to order commits, invalidations and external changes.

use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// One point on the logical timeline of an engine session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// Time before any tick; every commit is strictly later.
    pub const ZERO: LogicalTime = LogicalTime(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for LogicalTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Monotonically increasing counter shared by one engine session.
#[derive(Debug, Default)]
pub struct LogicalClock {
    current: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest issued time without advancing.
    pub fn now(&self) -> LogicalTime {
        LogicalTime(self.current.load(Ordering::SeqCst))
    }

    /// Advances the clock and returns the new, strictly later time.
    pub fn tick(&self) -> LogicalTime {
        LogicalTime(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{LogicalClock, LogicalTime};
    use std::sync::Arc;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LogicalClock::new();
        assert_eq!(clock.now(), LogicalTime::ZERO);
        let first = clock.tick();
        let second = clock.tick();
        assert!(first > LogicalTime::ZERO);
        assert!(second > first);
        assert_eq!(clock.now(), second);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LogicalClock::new());
        let handles = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..100).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut all = handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("tick thread should finish"))
            .collect::<Vec<_>>();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(clock.now().value(), 400);
    }
}
