//! Last-responder accounting for fan-out phases.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts the outstanding participants of a fan-out.
///
/// Each participant calls `complete_one` exactly once; the single caller that
/// observes the count reach zero runs the phase's terminal action. `arm`
/// reports an empty fan-out so the caller can run that action inline instead
/// of waiting for a responder that will never come.
pub struct Countdown {
    remaining: AtomicUsize,
}

impl Countdown {
    pub const fn new() -> Self {
        Self {
            remaining: AtomicUsize::new(0),
        }
    }

    /// Set the participant count for a new phase. Returns true when the
    /// fan-out is empty.
    pub fn arm(&self, participants: usize) -> bool {
        self.remaining.store(participants, Ordering::Release);
        participants == 0
    }

    /// Record one completed participant. Returns true for exactly the caller
    /// whose decrement took the count to zero.
    pub fn complete_one(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}
