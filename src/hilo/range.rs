use std::sync::atomic::{AtomicI64, Ordering};

/// One reserved identifier range, handed out from `min` to `max`
/// inclusive.
///
/// `current` is the last issued value and starts at `min - 1`; the range
/// is exhausted once `current` reaches `max`. Replaced wholesale on
/// refill, never mutated by two refills at once.
#[derive(Debug)]
pub struct IdRange {
    min: i64,
    max: i64,
    current: AtomicI64,
}

impl IdRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            current: AtomicI64::new(min - 1),
        }
    }

    /// An already-exhausted range, forcing a refill on first allocation.
    pub fn empty() -> Self {
        Self::new(1, 0)
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Last issued value.
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Claim the next value, or `None` when the range is exhausted.
    pub fn try_next(&self) -> Option<i64> {
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if id <= self.max { Some(id) } else { None }
    }
}
