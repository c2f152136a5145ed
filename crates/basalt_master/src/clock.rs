//! Hybrid timestamps and the master-side clock.
//!
//! A `HybridTime` packs physical microseconds and a logical counter into one
//! ordered `u64`. The master clock never moves backwards and folds in every
//! timestamp carried on a tablet-server response, so a read point chosen here
//! is never below anything a tablet server has already served.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Low bits reserved for the logical component of a hybrid timestamp.
const LOGICAL_BITS: u32 = 12;

/// A hybrid logical-plus-physical timestamp.
///
/// The raw value zero is the "no timestamp" sentinel; a valid timestamp is
/// always non-zero because `HybridClock::now` never returns it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HybridTime(u64);

impl HybridTime {
    /// Sentinel for "no timestamp chosen yet".
    pub const INVALID: HybridTime = HybridTime(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_micros(micros: u64) -> Self {
        Self(micros << LOGICAL_BITS)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & ((1 << LOGICAL_BITS) - 1)
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "<invalid>");
        }
        write!(f, "{}.{}", self.physical_micros(), self.logical())
    }
}

/// Monotonic hybrid clock shared by every RPC the master sends.
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next timestamp: the physical reading, or one logical tick past the
    /// highest value this clock has seen.
    pub fn now(&self) -> HybridTime {
        let physical = epoch_micros() << LOGICAL_BITS;
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(physical.max(last.saturating_add(1)))
            })
            .unwrap_or(0);
        HybridTime(physical.max(prev.saturating_add(1)))
    }

    /// Fold a peer's clock reading into this clock.
    pub fn observe(&self, ht: HybridTime) {
        if !ht.is_valid() {
            return;
        }
        self.last.fetch_max(ht.raw(), Ordering::AcqRel);
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Current epoch time in microseconds (saturating).
fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

/// Current epoch time in milliseconds, for state-change messages.
pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_monotonic() {
        let clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn observe_pushes_the_clock_forward() {
        let clock = HybridClock::new();
        let far_ahead = HybridTime::from_raw(clock.now().raw() + (1 << 30));
        clock.observe(far_ahead);
        assert!(clock.now() > far_ahead);
    }

    #[test]
    fn observe_ignores_invalid_and_stale_readings() {
        let clock = HybridClock::new();
        let before = clock.now();
        clock.observe(HybridTime::INVALID);
        clock.observe(HybridTime::from_raw(1));
        let after = clock.now();
        assert!(after > before);
        // A stale observation must not rewind the clock below `before`.
        assert!(after.raw() > before.raw());
    }

    #[test]
    fn ordering_follows_raw_value() {
        assert!(HybridTime::from_raw(110) > HybridTime::from_raw(95));
        assert!(HybridTime::from_micros(2) > HybridTime::from_micros(1));
        assert!(!HybridTime::INVALID.is_valid());
        assert!(HybridTime::from_raw(1).is_valid());
    }
}
