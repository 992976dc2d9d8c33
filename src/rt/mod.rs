#[macro_use]
pub mod location;

pub mod clock;
pub use self::clock::VectorClock;

pub mod consistency;
pub use self::consistency::{CoherenceChecker, ConsistencyChecker, Inconsistency, NoChecker};

pub mod engine;
pub use self::engine::{
    AllocationStep, BacktrackingPoint, EngineConfig, EngineHooks, EventStructure, ResponseStep,
    Step,
};

pub mod event;
pub use self::event::{Event, EventId, EventStore};

pub mod execution;
pub use self::execution::{Execution, MemoryAccessIndex};

pub mod executor;
pub use self::executor::{ExecutorTimeout, FixedActiveThreadsExecutor};

pub mod failure;
pub use self::failure::{Failure, SwitchReason};

pub mod frontier;
pub use self::frontier::ExecutionFrontier;

pub mod label;
pub use self::label::{
    synchronize, EventLabel, LabelKind, MemoryInit, MemoryInitializer, SpanKind, SyncType,
};

pub mod memory;
pub use self::memory::{
    ClassDescriptor, ClassTable, FieldKind, MemoryLocation, ObjectMapper, SimHeap,
};

pub mod object;
pub use self::object::{ObjRef, ObjectCell, ObjectEntry, ObjectRegistry};

pub mod replay;

pub(crate) mod scheduler;

pub mod value;
pub use self::value::{
    ObjectId, PrimitiveKind, PrimitiveValue, Value, ValueId, INVALID_OBJECT_ID, NULL_OBJECT_ID,
    STATIC_OBJECT_ID,
};

use std::fmt;

/// Maximum number of threads that can be included in a model.
pub const MAX_THREADS: usize = 8;

/// Clock slots: one per model thread plus the initialization pseudo-thread.
pub(crate) const CLOCK_SLOTS: usize = MAX_THREADS + 1;

/// Identical read responses at one code location before the engine signals a
/// cooperative switch.
pub const DEFAULT_SPIN_BOUND: usize = 5;

/// Identifies one model thread. The worker pool addresses threads by the
/// same stable index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

/// Pseudo-thread owning the initialization event.
pub const INIT_THREAD_ID: ThreadId = ThreadId(MAX_THREADS);

/// The thread the test harness itself runs on.
pub const MAIN_THREAD_ID: ThreadId = ThreadId(0);

impl ThreadId {
    pub fn from_usize(id: usize) -> ThreadId {
        assert!(id < CLOCK_SLOTS, "thread id {} out of range", id);
        ThreadId(id)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "ThreadId({})", self.0)
    }
}
