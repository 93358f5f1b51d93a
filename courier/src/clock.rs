//! Per-sender client clock.

use parking_lot::Mutex;

use courier_proto::message::Timestamp;

/// Wall clock that never repeats or goes backwards.
///
/// Two messages composed in the same millisecond, or across a wall-clock
/// step backwards, still get strictly increasing client timestamps.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<u64>,
}

impl MonotonicClock {
    /// Create a clock with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, strictly greater than every one returned before.
    pub fn now(&self) -> Timestamp {
        self.next_after(Timestamp::now())
    }

    /// Make every later reading strictly greater than `seen`.
    ///
    /// Used with timestamps recovered from storage, which may come from a
    /// wall clock that has since stepped backwards.
    pub fn advance_past(&self, seen: Timestamp) {
        let mut last = self.last.lock();
        *last = (*last).max(seen.as_millis());
    }

    fn next_after(&self, wall: Timestamp) -> Timestamp {
        let mut last = self.last.lock();
        let next = wall.as_millis().max(last.saturating_add(1));
        *last = next;
        Timestamp::from_millis(next)
    }
}
