use crate::rt::clock::VectorClock;
use crate::rt::label::EventLabel;
use crate::rt::ThreadId;

use std::fmt;
use std::ops;

/// Globally unique, monotonically increasing event identifier.
///
/// Ids are arena indices; parents and dependencies always have smaller ids,
/// so the event graph is acyclic by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(usize);

impl EventId {
    pub(crate) fn from_usize(id: usize) -> EventId {
        EventId(id)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "e{}", self.0)
    }
}

/// One immutable thread action plus its causal links.
#[derive(Debug)]
pub struct Event {
    pub id: EventId,
    pub thread_id: ThreadId,
    pub thread_position: usize,
    pub label: EventLabel,
    /// Program-order predecessor; absent only for the root.
    pub parent: Option<EventId>,
    /// Synchronization predecessors, strictly earlier in id order.
    pub dependencies: Vec<EventId>,
    /// Allocation event of the object the label touches, if tracked.
    pub allocation: Option<EventId>,
    /// For a response, the send it synchronized with; for an exclusive write,
    /// its paired read response.
    pub source: Option<EventId>,
    /// Structural causality: pointwise max over parent and dependencies,
    /// with this event's own slot set.
    pub causality_clock: VectorClock,
    /// Release/acquire view: like the causality clock, but a dependency only
    /// contributes if the pair synchronizes.
    pub sync_clock: VectorClock,
}

/// Arena of all events created during one run, keyed by id.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> EventStore {
        EventStore { events: Vec::new() }
    }

    /// Construct and insert an event, computing both clocks.
    ///
    /// `sync_deps` is the subset of `dependencies` whose view transfers into
    /// the new event.
    pub(crate) fn create(
        &mut self,
        thread_id: ThreadId,
        label: EventLabel,
        parent: Option<EventId>,
        dependencies: Vec<EventId>,
        sync_deps: &[EventId],
        allocation: Option<EventId>,
        source: Option<EventId>,
    ) -> EventId {
        let id = EventId(self.events.len());

        let thread_position = match parent {
            Some(parent) => {
                let parent = &self[parent];
                assert_eq!(
                    parent.thread_id, thread_id,
                    "[weft internal bug] parent on a different thread"
                );
                parent.thread_position + 1
            }
            None => 0,
        };

        let mut causality_clock = VectorClock::new();
        let mut sync_clock = VectorClock::new();

        if let Some(parent) = parent {
            causality_clock.join(&self[parent].causality_clock);
            sync_clock.join(&self[parent].sync_clock);
        }

        for &dep in &dependencies {
            assert!(
                dep < id,
                "[weft internal bug] dependency {} of {} not created yet",
                dep,
                id
            );
            causality_clock.join(&self[dep].causality_clock);
        }

        for &dep in sync_deps {
            sync_clock.join(&self[dep].sync_clock);
        }

        causality_clock.set(thread_id, thread_position);
        sync_clock.set(thread_id, thread_position);

        self.events.push(Event {
            id,
            thread_id,
            thread_position,
            label,
            parent,
            dependencies,
            allocation,
            source,
            causality_clock,
            sync_clock,
        });

        id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: EventId) -> &Event {
        &self.events[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// `true` when `a` is in the causal past of `b`.
    pub fn causally_precedes(&self, a: EventId, b: EventId) -> bool {
        a != b && {
            let a = &self[a];
            self[b].causality_clock.observes(a.thread_id, a.thread_position)
        }
    }

    /// `true` when `a` happens-before `b` in the release/acquire view.
    pub fn sync_precedes(&self, a: EventId, b: EventId) -> bool {
        a != b && {
            let a = &self[a];
            self[b].sync_clock.observes(a.thread_id, a.thread_position)
        }
    }
}

impl ops::Index<EventId> for EventStore {
    type Output = Event;

    fn index(&self, index: EventId) -> &Event {
        &self.events[index.0]
    }
}
