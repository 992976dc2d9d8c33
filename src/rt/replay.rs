use crate::rt::event::{EventId, EventStore};
use crate::rt::location::CodeLocation;
use crate::rt::memory::MemoryLocation;
use crate::rt::value::ValueId;
use crate::rt::{ThreadId, CLOCK_SLOTS};

use std::collections::HashMap;

/// Linear event list a fresh exploration is driven through.
///
/// The engine consults the replayer on every append: events are taken
/// verbatim while the list lasts, everything after is genuinely new.
#[derive(Debug, Default)]
pub struct Replayer {
    order: Vec<EventId>,
    pos: usize,
    remaining: [usize; CLOCK_SLOTS],
}

impl Replayer {
    pub fn new(order: Vec<EventId>, store: &EventStore) -> Replayer {
        let mut remaining = [0; CLOCK_SLOTS];
        for &event in &order {
            remaining[store[event].thread_id.as_usize()] += 1;
        }

        Replayer {
            order,
            pos: 0,
            remaining,
        }
    }

    pub fn rewind(&mut self, store: &EventStore) {
        self.remaining = [0; CLOCK_SLOTS];
        for &event in &self.order {
            self.remaining[store[event].thread_id.as_usize()] += 1;
        }
        self.pos = 0;
    }

    pub fn peek(&self) -> Option<EventId> {
        self.order.get(self.pos).copied()
    }

    pub fn advance(&mut self, store: &EventStore) -> EventId {
        let event = self.order[self.pos];
        self.pos += 1;
        self.remaining[store[event].thread_id.as_usize()] -= 1;
        event
    }

    pub fn in_replay_phase(&self) -> bool {
        self.pos < self.order.len()
    }

    /// `true` while the stored order still holds events of `thread`.
    pub fn has_events_for(&self, thread: ThreadId) -> bool {
        self.remaining[thread.as_usize()] > 0
    }
}

/// Counts identical read responses per `(thread, code location)` to bound
/// spin-wait patterns.
#[derive(Debug)]
pub struct LoopDetector {
    spin_bound: usize,
    history: HashMap<(ThreadId, CodeLocation), Vec<(MemoryLocation, ValueId)>>,
}

impl LoopDetector {
    pub fn new(spin_bound: usize) -> LoopDetector {
        LoopDetector {
            spin_bound,
            history: HashMap::new(),
        }
    }

    /// Record a read response; `true` once the location saturates.
    pub fn record(
        &mut self,
        thread: ThreadId,
        code: CodeLocation,
        location: MemoryLocation,
        value: ValueId,
    ) -> bool {
        let spin_bound = self.spin_bound;
        let history = self.history.entry((thread, code)).or_insert_with(Vec::new);
        history.push((location, value));
        Self::is_saturated_with_bound(spin_bound, history)
    }

    /// Would one more identical read at this location spin in place?
    pub fn saturated(
        &self,
        thread: ThreadId,
        code: CodeLocation,
        location: &MemoryLocation,
        value: ValueId,
    ) -> bool {
        match self.history.get(&(thread, code)) {
            Some(history) => {
                Self::is_saturated_with_bound(self.spin_bound, history)
                    && history
                        .last()
                        .map_or(false, |(l, v)| l == location && *v == value)
            }
            None => false,
        }
    }

    fn is_saturated_with_bound(spin_bound: usize, history: &[(MemoryLocation, ValueId)]) -> bool {
        if history.len() < spin_bound {
            return false;
        }

        let (location, value) = &history[history.len() - 1];
        history[history.len() - spin_bound..]
            .iter()
            .all(|(l, v)| l == location && v == value)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
