use crate::rt::clock::VectorClock;
use crate::rt::event::{EventId, EventStore};
use crate::rt::frontier::ExecutionFrontier;
use crate::rt::label::{EventLabel, LabelKind};
use crate::rt::memory::MemoryLocation;
use crate::rt::{ThreadId, CLOCK_SLOTS};

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

/// The growing partial order of one exploration: per-thread contiguous event
/// sequences plus the memory-access index.
///
/// Append-only within an exploration; on backtrack it is rebuilt wholesale
/// from a stored frontier.
pub struct Execution {
    threads: Vec<Vec<EventId>>,
    index: MemoryAccessIndex,
}

impl Execution {
    pub fn new() -> Execution {
        Execution {
            threads: vec![Vec::new(); CLOCK_SLOTS],
            index: MemoryAccessIndex::new(),
        }
    }

    /// Materialize the execution a frontier denotes, rebuilding the
    /// memory-access index incrementally in id order.
    pub fn from_frontier(store: &EventStore, frontier: &ExecutionFrontier) -> Execution {
        let mut execution = Execution::new();

        for last in frontier.iter() {
            let thread = store[last].thread_id.as_usize();
            let mut chain = Vec::with_capacity(store[last].thread_position + 1);
            let mut cur = Some(last);
            while let Some(e) = cur {
                chain.push(e);
                cur = store[e].parent;
            }
            chain.reverse();
            execution.threads[thread] = chain;
        }

        let mut all: Vec<EventId> = execution.threads.iter().flatten().copied().collect();
        all.sort();
        for event in all {
            execution.index.update(store, event);
        }

        execution
    }

    /// Append at the thread's frontier. Thread sequences stay contiguous.
    pub fn append(&mut self, store: &EventStore, event: EventId) {
        let e = &store[event];
        let seq = &mut self.threads[e.thread_id.as_usize()];

        assert_eq!(
            seq.len(),
            e.thread_position,
            "[weft internal bug] non-contiguous append of {} on thread {}",
            event,
            e.thread_id
        );

        trace!(event = %event, thread = %e.thread_id, label = ?e.label, "append");

        seq.push(event);
        self.index.update(store, event);
    }

    pub fn thread_events(&self, thread: ThreadId) -> &[EventId] {
        &self.threads[thread.as_usize()]
    }

    pub fn event_at(&self, thread: ThreadId, position: usize) -> Option<EventId> {
        self.threads[thread.as_usize()].get(position).copied()
    }

    pub fn contains(&self, store: &EventStore, event: EventId) -> bool {
        self.event_at(store[event].thread_id, store[event].thread_position) == Some(event)
    }

    /// The response at `position + 1` of a blocking request, if present.
    pub fn response_of(&self, store: &EventStore, request: EventId) -> Option<EventId> {
        let req = &store[request];
        self.event_at(req.thread_id, req.thread_position + 1)
            .filter(|&e| store[e].parent == Some(request) && store[e].label.is_response())
    }

    pub fn frontier(&self, store: &EventStore) -> ExecutionFrontier {
        let mut frontier = ExecutionFrontier::new();
        for seq in &self.threads {
            if let Some(&last) = seq.last() {
                frontier.update(store, last);
            }
        }
        frontier
    }

    /// Frontier of the causal past a clock describes.
    pub fn frontier_of_clock(&self, store: &EventStore, clock: &VectorClock) -> ExecutionFrontier {
        let mut frontier = ExecutionFrontier::new();
        for thread in 0..CLOCK_SLOTS {
            let count = clock.count(ThreadId::from_usize(thread));
            if count > 0 {
                if let Some(&event) = self.threads[thread].get(count - 1) {
                    frontier.update(store, event);
                }
            }
        }
        frontier
    }

    /// All events in global id order; this is also a legal linearization
    /// (dependencies and parents always have smaller ids).
    pub fn events_in_id_order(&self) -> Vec<EventId> {
        let mut all: Vec<EventId> = self.threads.iter().flatten().copied().collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.threads.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.iter().all(Vec::is_empty)
    }

    pub fn index(&self) -> &MemoryAccessIndex {
        &self.index
    }
}

impl Default for Execution {
    fn default() -> Execution {
        Execution::new()
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Execution")
            .field("threads", &self.threads)
            .finish()
    }
}

/// Per-location access lists with cached race-freedom flags.
#[derive(Debug, Default)]
struct LocationAccesses {
    read_requests: Vec<EventId>,
    writes: Vec<EventId>,
    /// At most one writer thread and no read racing a write.
    race_free: bool,
    /// No reader at all and no two racing writes.
    read_write_race_free: bool,
}

impl LocationAccesses {
    fn new() -> LocationAccesses {
        LocationAccesses {
            read_requests: Vec::new(),
            writes: Vec::new(),
            race_free: true,
            read_write_race_free: true,
        }
    }
}

/// Index over the execution's reads and writes, per memory location.
#[derive(Debug, Default)]
pub struct MemoryAccessIndex {
    locations: HashMap<MemoryLocation, LocationAccesses>,
}

impl MemoryAccessIndex {
    fn new() -> MemoryAccessIndex {
        MemoryAccessIndex {
            locations: HashMap::new(),
        }
    }

    fn update(&mut self, store: &EventStore, event: EventId) {
        let location = match store[event].label.location() {
            Some(location) => location.clone(),
            None => return,
        };

        match &store[event].label {
            EventLabel::Read {
                kind: LabelKind::Request,
                ..
            } => {
                let accesses = self
                    .locations
                    .entry(location)
                    .or_insert_with(LocationAccesses::new);

                accesses.read_write_race_free = false;

                if accesses
                    .writes
                    .iter()
                    .any(|&w| concurrent(store, w, event))
                {
                    accesses.race_free = false;
                }

                accesses.read_requests.push(event);
            }
            EventLabel::Write { .. } => {
                let accesses = self
                    .locations
                    .entry(location)
                    .or_insert_with(LocationAccesses::new);

                let thread = store[event].thread_id;
                if accesses
                    .writes
                    .iter()
                    .any(|&w| store[w].thread_id != thread)
                {
                    accesses.race_free = false;
                }
                if accesses
                    .writes
                    .iter()
                    .any(|&w| concurrent(store, w, event))
                {
                    accesses.read_write_race_free = false;
                }
                if accesses
                    .read_requests
                    .iter()
                    .any(|&r| concurrent(store, r, event))
                {
                    accesses.race_free = false;
                }

                accesses.writes.push(event);
            }
            _ => {}
        }
    }

    pub fn read_requests(&self, location: &MemoryLocation) -> &[EventId] {
        self.locations
            .get(location)
            .map(|a| a.read_requests.as_slice())
            .unwrap_or(&[])
    }

    pub fn writes(&self, location: &MemoryLocation) -> &[EventId] {
        self.locations
            .get(location)
            .map(|a| a.writes.as_slice())
            .unwrap_or(&[])
    }

    /// Most recent write in execution order.
    pub fn last_write(&self, location: &MemoryLocation) -> Option<EventId> {
        self.locations
            .get(location)
            .and_then(|a| a.writes.last().copied())
    }

    pub fn is_race_free(&self, location: &MemoryLocation) -> bool {
        self.locations
            .get(location)
            .map(|a| a.race_free)
            .unwrap_or(true)
    }

    pub fn is_read_write_race_free(&self, location: &MemoryLocation) -> bool {
        self.locations
            .get(location)
            .map(|a| a.read_write_race_free)
            .unwrap_or(true)
    }
}

fn concurrent(store: &EventStore, a: EventId, b: EventId) -> bool {
    !store.causally_precedes(a, b) && !store.causally_precedes(b, a)
}
