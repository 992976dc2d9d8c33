use crate::rt::event::{EventId, EventStore};
use crate::rt::{ThreadId, CLOCK_SLOTS};

/// Map from thread to its last included event.
///
/// A frontier denotes the execution made of every thread's prefix up to (and
/// including) the recorded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFrontier {
    last: [Option<EventId>; CLOCK_SLOTS],
}

impl ExecutionFrontier {
    pub fn new() -> ExecutionFrontier {
        ExecutionFrontier::default()
    }

    pub fn with_root(root: EventId, store: &EventStore) -> ExecutionFrontier {
        let mut frontier = ExecutionFrontier::new();
        frontier.update(store, root);
        frontier
    }

    pub fn get(&self, thread: ThreadId) -> Option<EventId> {
        self.last[thread.as_usize()]
    }

    /// Advance the thread's entry to `event` if it is further along.
    pub fn update(&mut self, store: &EventStore, event: EventId) {
        let thread = store[event].thread_id;
        let slot = &mut self.last[thread.as_usize()];

        match *slot {
            Some(cur) if store[cur].thread_position >= store[event].thread_position => {}
            _ => *slot = Some(event),
        }
    }

    /// Remove each event in `cut` together with all its causal successors,
    /// across every thread. Every thread entry rewinds to its longest prefix
    /// that observes none of the cut events, so the denoted execution stays
    /// dependency-closed.
    pub fn cut(&mut self, store: &EventStore, cut: &[EventId]) {
        if cut.is_empty() {
            return;
        }

        for slot in self.last.iter_mut() {
            let mut cur = *slot;
            while let Some(e) = cur {
                let depends = cut.iter().any(|&c| {
                    store[e]
                        .causality_clock
                        .observes(store[c].thread_id, store[c].thread_position)
                });
                if !depends {
                    break;
                }
                cur = store[e].parent;
            }
            *slot = cur;
        }
    }

    /// Rewind the thread's entry to `last` (or to empty).
    pub fn truncate_thread(&mut self, thread: ThreadId, last: Option<EventId>) {
        self.last[thread.as_usize()] = last;
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, store: &EventStore, other: &ExecutionFrontier) {
        for slot in other.last.iter().flatten() {
            self.update(store, *slot);
        }
    }

    pub fn contains(&self, store: &EventStore, event: EventId) -> bool {
        let thread = store[event].thread_id;
        match self.last[thread.as_usize()] {
            Some(last) => store[last].thread_position >= store[event].thread_position,
            None => false,
        }
    }

    pub fn contains_all(&self, store: &EventStore, events: &[EventId]) -> bool {
        events.iter().all(|&e| self.contains(store, e))
    }

    /// Frontier entries that are blocking requests still awaiting a response.
    pub fn dangling_requests(&self, store: &EventStore) -> Vec<EventId> {
        self.last
            .iter()
            .flatten()
            .copied()
            .filter(|&e| store[e].label.is_blocking())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = EventId> + '_ {
        self.last.iter().flatten().copied()
    }
}
