use crate::rt::event::{EventId, EventStore};
use crate::rt::execution::Execution;
use crate::rt::label::{EventLabel, LabelKind};
use crate::rt::memory::MemoryLocation;

use std::collections::HashMap;

use thiserror::Error;

/// A completed or in-flight execution that violates the memory model.
///
/// Returned by the consistency checker; the driver treats any value as a hard
/// failure for the current schedule.
#[derive(Debug, Error)]
pub enum Inconsistency {
    #[error(
        "coherence violation at {location}: {read} observes {write}, \
         which is already covered by {covering}"
    )]
    ReadCoherence {
        location: MemoryLocation,
        read: EventId,
        write: EventId,
        covering: EventId,
    },
    #[error(
        "atomicity violation at {location}: exclusive accesses {first} and \
         {second} both consumed {source_write}"
    )]
    Atomicity {
        location: MemoryLocation,
        source_write: EventId,
        first: EventId,
        second: EventId,
    },
}

/// Pluggable execution validity check.
pub trait ConsistencyChecker: Send {
    fn check(&self, execution: &Execution, store: &EventStore) -> Option<Inconsistency>;
}

/// Per-location coherence over the release/acquire view, plus exclusivity of
/// read-modify-write pairs.
#[derive(Debug, Default)]
pub struct CoherenceChecker;

impl ConsistencyChecker for CoherenceChecker {
    fn check(&self, execution: &Execution, store: &EventStore) -> Option<Inconsistency> {
        // A read must not stay on a write when a later write (in
        // happens-before order) is already in its view.
        for &read in execution.events_in_id_order().iter() {
            let event = &store[read];

            let (location, source) = match (&event.label, event.source) {
                (
                    EventLabel::Read {
                        kind: LabelKind::Response,
                        location,
                        ..
                    },
                    Some(source),
                ) => (location, source),
                _ => continue,
            };

            for &other in execution.index().writes(location) {
                if other == source {
                    continue;
                }
                let covering = &store[other];
                if store.sync_precedes(source, other)
                    && event
                        .sync_clock
                        .observes(covering.thread_id, covering.thread_position)
                {
                    return Some(Inconsistency::ReadCoherence {
                        location: location.clone(),
                        read,
                        write: source,
                        covering: other,
                    });
                }
            }
        }

        // Two successful exclusive accesses on one location must not consume
        // the same write. The root stands in for the initial value of many
        // locations, so the key carries the location as well.
        let mut consumed: HashMap<(EventId, MemoryLocation), EventId> = HashMap::new();

        for &write in execution
            .events_in_id_order()
            .iter()
            .filter(|&&e| matches!(store[e].label, EventLabel::Write { exclusive: true, .. }))
        {
            // The paired read response records which write the rmw consumed.
            let source = match store[write].source.and_then(|r| store[r].source) {
                Some(source) => source,
                None => continue,
            };

            let location = store[write]
                .label
                .location()
                .expect("[weft internal bug] write without location")
                .clone();

            if let Some(&first) = consumed.get(&(source, location.clone())) {
                return Some(Inconsistency::Atomicity {
                    location,
                    source_write: source,
                    first,
                    second: write,
                });
            }

            consumed.insert((source, location), write);
        }

        None
    }
}

/// Checker that accepts everything; for harnesses that validate externally.
#[derive(Debug, Default)]
pub struct NoChecker;

impl ConsistencyChecker for NoChecker {
    fn check(&self, _execution: &Execution, _store: &EventStore) -> Option<Inconsistency> {
        None
    }
}
