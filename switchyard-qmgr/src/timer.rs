//! One-shot timers keyed by what they do.
//!
//! Requesting a timer that is already armed moves it; there is never more
//! than one pending timer per [`TimerKind`].

use std::collections::BTreeSet;

use ahash::AHashMap;

use crate::arena::{DestinationId, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Give a dead transport another chance
    TransportUnthrottle(TransportId),
    /// Give a dead destination another chance
    DestinationUnthrottle(DestinationId),
    /// Periodic deferred queue scan
    DeferredScan,
}

#[derive(Debug, Default)]
pub struct Timers {
    queue: BTreeSet<(u64, u64, TimerKind)>,
    armed: AHashMap<TimerKind, (u64, u64)>,
    sequence: u64,
}

impl Timers {
    /// Arm `kind` to fire at `due`, replacing any earlier request.
    pub fn request(&mut self, kind: TimerKind, due: u64) {
        self.cancel(kind);
        self.sequence += 1;
        self.queue.insert((due, self.sequence, kind));
        self.armed.insert(kind, (due, self.sequence));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((due, sequence)) = self.armed.remove(&kind) {
            self.queue.remove(&(due, sequence, kind));
        }
    }

    #[must_use]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// When the earliest timer fires.
    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.queue.first().map(|(due, _, _)| *due)
    }

    /// Disarm and return the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<TimerKind> {
        let &(due, sequence, kind) = self.queue.first()?;
        if due > now {
            return None;
        }
        self.queue.remove(&(due, sequence, kind));
        self.armed.remove(&kind);
        Some(kind)
    }
}
