use crate::rt::location::CodeLocation;
use crate::rt::memory::MemoryLocation;
use crate::rt::value::{ObjectId, ValueId};
use crate::rt::ThreadId;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Two-phase marker for labels of blocking and interacting actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Start,
    End,
}

/// How a label participates in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    None,
    Binary,
    Barrier,
}

/// Supplies the value a location holds before the first write.
pub trait MemoryInitializer: Send + Sync {
    fn initial_value(&self, location: &MemoryLocation) -> ValueId;
}

/// Shared handle to the initializer, embedded in initialization and
/// allocation labels.
#[derive(Clone)]
pub struct MemoryInit(Arc<dyn MemoryInitializer>);

impl MemoryInit {
    pub fn new(init: Arc<dyn MemoryInitializer>) -> MemoryInit {
        MemoryInit(init)
    }

    pub fn initial_value(&self, location: &MemoryLocation) -> ValueId {
        self.0.initial_value(location)
    }
}

impl fmt::Debug for MemoryInit {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "MemoryInit(..)")
    }
}

/// The typed payload of one event.
#[derive(Debug, Clone)]
pub enum EventLabel {
    /// Root of the event structure.
    Initialization {
        init_thread_id: ThreadId,
        main_thread_id: ThreadId,
        memory_init: MemoryInit,
    },
    ObjectAllocation {
        object_id: ObjectId,
        class_name: Arc<str>,
        memory_init: MemoryInit,
    },
    Read {
        kind: LabelKind,
        location: MemoryLocation,
        /// `None` on the request, the observed value on the response.
        value: Option<ValueId>,
        ordering: Ordering,
        exclusive: bool,
        code_location: CodeLocation,
    },
    Write {
        location: MemoryLocation,
        value: ValueId,
        ordering: Ordering,
        exclusive: bool,
        code_location: CodeLocation,
    },
    Lock {
        kind: LabelKind,
        mutex: ObjectId,
        reentry: bool,
        depth: usize,
        synthetic: bool,
    },
    Unlock {
        mutex: ObjectId,
        reentry: bool,
        depth: usize,
        synthetic: bool,
    },
    Wait {
        kind: LabelKind,
        mutex: ObjectId,
    },
    Notify {
        mutex: ObjectId,
        broadcast: bool,
    },
    Park {
        kind: LabelKind,
        thread_id: ThreadId,
    },
    /// `thread_id` is the parked thread the token is addressed to.
    Unpark {
        thread_id: ThreadId,
    },
    ThreadStart {
        kind: LabelKind,
        thread_id: ThreadId,
    },
    ThreadFinish {
        thread_id: ThreadId,
    },
    ThreadFork {
        threads: BTreeSet<ThreadId>,
    },
    /// The pending set shrinks as finishes fold in; the label promotes to a
    /// response once it drains.
    ThreadJoin {
        kind: LabelKind,
        pending: BTreeSet<ThreadId>,
    },
    CoroutineSuspend {
        kind: LabelKind,
        thread_id: ThreadId,
        actor_id: usize,
        prompt_cancellation: bool,
        cancelled: bool,
    },
    CoroutineResume {
        thread_id: ThreadId,
        actor_id: usize,
    },
    ActorSpan {
        span: SpanKind,
        thread_id: ThreadId,
        actor_id: usize,
    },
    Random {
        value: u64,
    },
}

impl EventLabel {
    pub fn kind(&self) -> Option<LabelKind> {
        match self {
            EventLabel::Read { kind, .. }
            | EventLabel::Lock { kind, .. }
            | EventLabel::Wait { kind, .. }
            | EventLabel::Park { kind, .. }
            | EventLabel::ThreadStart { kind, .. }
            | EventLabel::ThreadJoin { kind, .. }
            | EventLabel::CoroutineSuspend { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == Some(LabelKind::Request)
    }

    pub fn is_response(&self) -> bool {
        self.kind() == Some(LabelKind::Response)
    }

    /// One-shot labels that may answer a request.
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            EventLabel::Initialization { .. }
                | EventLabel::ObjectAllocation { .. }
                | EventLabel::Write { .. }
                | EventLabel::Unlock { .. }
                | EventLabel::Notify { .. }
                | EventLabel::Unpark { .. }
                | EventLabel::ThreadFinish { .. }
                | EventLabel::ThreadFork { .. }
                | EventLabel::CoroutineResume { .. }
        )
    }

    /// Requests whose thread cannot proceed until a response exists.
    pub fn is_blocking(&self) -> bool {
        self.is_request()
            && matches!(
                self,
                EventLabel::Lock { .. }
                    | EventLabel::Wait { .. }
                    | EventLabel::Park { .. }
                    | EventLabel::ThreadStart { .. }
                    | EventLabel::ThreadJoin { .. }
                    | EventLabel::CoroutineSuspend { .. }
            )
    }

    /// `false` only for a label that still represents a blocked state.
    pub fn is_unblocked(&self) -> bool {
        match self {
            EventLabel::ThreadJoin { kind, pending } => {
                *kind == LabelKind::Response && pending.is_empty()
            }
            label => !label.is_blocking(),
        }
    }

    pub fn sync_type(&self) -> SyncType {
        match self {
            EventLabel::ThreadJoin { .. } | EventLabel::ThreadFinish { .. } => SyncType::Barrier,
            EventLabel::ActorSpan { .. } | EventLabel::Random { .. } => SyncType::None,
            _ => SyncType::Binary,
        }
    }

    pub fn location(&self) -> Option<&MemoryLocation> {
        match self {
            EventLabel::Read { location, .. } | EventLabel::Write { location, .. } => {
                Some(location)
            }
            _ => None,
        }
    }

    pub fn code_location(&self) -> Option<CodeLocation> {
        match self {
            EventLabel::Read { code_location, .. } | EventLabel::Write { code_location, .. } => {
                Some(*code_location)
            }
            _ => None,
        }
    }

    pub fn read_value(&self) -> Option<ValueId> {
        match self {
            EventLabel::Read {
                kind: LabelKind::Response,
                value,
                ..
            } => *value,
            _ => None,
        }
    }

    /// Whether a response formed from `send ⊕ self` carries the send's
    /// synchronization view. Monitor, thread and coroutine operations always
    /// synchronize; plain memory accesses only under release/acquire.
    pub fn acquires_from(&self, send: &EventLabel) -> bool {
        match (send, self) {
            (EventLabel::Write { ordering: w, .. }, EventLabel::Read { ordering: r, .. }) => {
                is_release(*w) && is_acquire(*r)
            }
            _ => true,
        }
    }
}

fn is_release(ordering: Ordering) -> bool {
    matches!(
        ordering,
        Ordering::Release | Ordering::AcqRel | Ordering::SeqCst
    )
}

fn is_acquire(ordering: Ordering) -> bool {
    matches!(
        ordering,
        Ordering::Acquire | Ordering::AcqRel | Ordering::SeqCst
    )
}

/// The synchronization algebra: `send ⊕ request`.
///
/// Total on legal pairs (one family, same resource); every other pair is
/// undefined. For the barrier family (thread join) the result may still be a
/// request; the engine folds further sends into it.
pub fn synchronize(send: &EventLabel, request: &EventLabel) -> Option<EventLabel> {
    use EventLabel::*;
    use LabelKind::*;

    match (send, request) {
        // Memory: a write answers a read request on the same location.
        (
            Write {
                location: wloc,
                value,
                ..
            },
            Read {
                kind: Request,
                location,
                ordering,
                exclusive,
                code_location,
                ..
            },
        ) if wloc == location => Some(Read {
            kind: Response,
            location: location.clone(),
            value: Some(*value),
            ordering: *ordering,
            exclusive: *exclusive,
            code_location: *code_location,
        }),

        // The root and allocation events stand in for the initial write.
        (
            Initialization { memory_init, .. },
            Read {
                kind: Request,
                location,
                ordering,
                exclusive,
                code_location,
                ..
            },
        ) => Some(Read {
            kind: Response,
            location: location.clone(),
            value: Some(memory_init.initial_value(location)),
            ordering: *ordering,
            exclusive: *exclusive,
            code_location: *code_location,
        }),
        (
            ObjectAllocation {
                object_id,
                memory_init,
                ..
            },
            Read {
                kind: Request,
                location,
                ordering,
                exclusive,
                code_location,
                ..
            },
        ) if location.object_id() == Some(*object_id) => Some(Read {
            kind: Response,
            location: location.clone(),
            value: Some(memory_init.initial_value(location)),
            ordering: *ordering,
            exclusive: *exclusive,
            code_location: *code_location,
        }),

        // Monitors: a final unlock answers a lock request; inner reentrant
        // releases keep the monitor held. The allocation event is the initial
        // unlock and the only partner for re-entry.
        (
            Unlock {
                mutex: m,
                reentry: false,
                ..
            },
            Lock {
                kind: Request,
                mutex,
                reentry,
                depth,
                synthetic,
            },
        ) if m == mutex && !reentry => Some(Lock {
            kind: Response,
            mutex: *mutex,
            reentry: *reentry,
            depth: *depth,
            synthetic: *synthetic,
        }),
        (
            ObjectAllocation { object_id, .. },
            Lock {
                kind: Request,
                mutex,
                reentry,
                depth,
                synthetic,
            },
        ) if object_id == mutex => Some(Lock {
            kind: Response,
            mutex: *mutex,
            reentry: *reentry,
            depth: *depth,
            synthetic: *synthetic,
        }),
        // The root is the initial unlock of monitors that predate the test.
        // The engine only offers it for mutexes the root allocated.
        (
            Initialization { .. },
            Lock {
                kind: Request,
                mutex,
                reentry,
                depth,
                synthetic,
            },
        ) => Some(Lock {
            kind: Response,
            mutex: *mutex,
            reentry: *reentry,
            depth: *depth,
            synthetic: *synthetic,
        }),

        (Notify { mutex: m, .. }, Wait { kind: Request, mutex }) if m == mutex => Some(Wait {
            kind: Response,
            mutex: *mutex,
        }),

        (Unpark { thread_id: t }, Park { kind: Request, thread_id }) if t == thread_id => {
            Some(Park {
                kind: Response,
                thread_id: *thread_id,
            })
        }

        // Thread lifecycle.
        (
            ThreadFork { threads },
            ThreadStart {
                kind: Request,
                thread_id,
            },
        ) if threads.contains(thread_id) => Some(ThreadStart {
            kind: Response,
            thread_id: *thread_id,
        }),
        (
            Initialization { main_thread_id, .. },
            ThreadStart {
                kind: Request,
                thread_id,
            },
        ) if main_thread_id == thread_id => Some(ThreadStart {
            kind: Response,
            thread_id: *thread_id,
        }),

        // Barrier: each finish removes itself from the pending set; the label
        // promotes once the set drains.
        (ThreadFinish { thread_id }, ThreadJoin { kind: Request, pending })
            if pending.contains(thread_id) =>
        {
            let mut pending = pending.clone();
            pending.remove(thread_id);

            Some(ThreadJoin {
                kind: if pending.is_empty() { Response } else { Request },
                pending,
            })
        }

        // Coroutines: resumption, or prompt cancellation against the root.
        (
            CoroutineResume {
                thread_id: t,
                actor_id: a,
            },
            CoroutineSuspend {
                kind: Request,
                thread_id,
                actor_id,
                prompt_cancellation,
                ..
            },
        ) if t == thread_id && a == actor_id => Some(CoroutineSuspend {
            kind: Response,
            thread_id: *thread_id,
            actor_id: *actor_id,
            prompt_cancellation: *prompt_cancellation,
            cancelled: false,
        }),
        (
            Initialization { .. },
            CoroutineSuspend {
                kind: Request,
                thread_id,
                actor_id,
                prompt_cancellation: true,
                ..
            },
        ) => Some(CoroutineSuspend {
            kind: Response,
            thread_id: *thread_id,
            actor_id: *actor_id,
            prompt_cancellation: true,
            cancelled: true,
        }),

        _ => None,
    }
}

/// Replay equivalence: a recorded label matches a freshly attempted one when
/// the operation and its operands agree. Response-side payloads (read values,
/// shrunk join sets, random values) are owned by the recording.
pub fn replay_matches(recorded: &EventLabel, fresh: &EventLabel) -> bool {
    use EventLabel::*;

    match (recorded, fresh) {
        (Initialization { .. }, Initialization { .. }) => true,
        (ObjectAllocation { class_name: a, .. }, ObjectAllocation { class_name: b, .. }) => a == b,
        (
            Read {
                kind: ka,
                location: la,
                exclusive: xa,
                ..
            },
            Read {
                kind: kb,
                location: lb,
                exclusive: xb,
                ..
            },
        ) => ka == kb && la == lb && xa == xb,
        (
            Write {
                location: la,
                value: va,
                exclusive: xa,
                ..
            },
            Write {
                location: lb,
                value: vb,
                exclusive: xb,
                ..
            },
        ) => la == lb && va == vb && xa == xb,
        (
            Lock {
                kind: ka, mutex: ma, ..
            },
            Lock {
                kind: kb, mutex: mb, ..
            },
        ) => ka == kb && ma == mb,
        (Unlock { mutex: ma, .. }, Unlock { mutex: mb, .. }) => ma == mb,
        (Wait { kind: ka, mutex: ma }, Wait { kind: kb, mutex: mb }) => ka == kb && ma == mb,
        (Notify { mutex: ma, .. }, Notify { mutex: mb, .. }) => ma == mb,
        (
            Park {
                kind: ka,
                thread_id: ta,
            },
            Park {
                kind: kb,
                thread_id: tb,
            },
        ) => ka == kb && ta == tb,
        (Unpark { thread_id: ta }, Unpark { thread_id: tb }) => ta == tb,
        (
            ThreadStart {
                kind: ka,
                thread_id: ta,
            },
            ThreadStart {
                kind: kb,
                thread_id: tb,
            },
        ) => ka == kb && ta == tb,
        (ThreadFinish { thread_id: ta }, ThreadFinish { thread_id: tb }) => ta == tb,
        (ThreadFork { threads: a }, ThreadFork { threads: b }) => a == b,
        (ThreadJoin { kind: ka, .. }, ThreadJoin { kind: kb, .. }) => ka == kb,
        (
            CoroutineSuspend {
                kind: ka,
                thread_id: ta,
                actor_id: aa,
                ..
            },
            CoroutineSuspend {
                kind: kb,
                thread_id: tb,
                actor_id: ab,
                ..
            },
        ) => ka == kb && ta == tb && aa == ab,
        (
            CoroutineResume {
                thread_id: ta,
                actor_id: aa,
            },
            CoroutineResume {
                thread_id: tb,
                actor_id: ab,
            },
        ) => ta == tb && aa == ab,
        (
            ActorSpan {
                span: sa,
                thread_id: ta,
                actor_id: aa,
            },
            ActorSpan {
                span: sb,
                thread_id: tb,
                actor_id: ab,
            },
        ) => sa == sb && ta == tb && aa == ab,
        (Random { .. }, Random { .. }) => true,
        _ => false,
    }
}
