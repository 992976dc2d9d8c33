use crate::rt::engine::{AllocationStep, EventStructure, ResponseStep, Step};
use crate::rt::event::EventId;
use crate::rt::failure::Failure;
use crate::rt::label::SpanKind;
use crate::rt::location::CodeLocation;
use crate::rt::memory::{CellSnapshot, MemoryLocation, SimHeap};
use crate::rt::object::ObjRef;
use crate::rt::value::{ObjectId, Value};
use crate::rt::ThreadId;

use std::collections::BTreeSet;
use std::fmt;
use std::panic;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};

use tracing::{debug, info};

/// Panic payload used to unwind workers out of an aborted schedule. Caught at
/// the task boundary; anything else escaping a worker is a real panic.
pub(crate) struct ExplorationAborted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Ready,
    Blocked(EventId),
    Finished,
}

struct Inner {
    engine: EventStructure,
    state: Vec<ThreadState>,
    /// Thread currently advancing the user program. Ignored while the
    /// replayer dictates the order.
    active: usize,
    abort: bool,
    failure: Option<Failure>,
}

/// Cooperative schedule gate: at most one worker advances the user program
/// at any instant; every interception enters the engine under this lock.
pub(crate) struct Scheduler {
    inner: Mutex<Inner>,
    cv: Condvar,
    rng: Mutex<u64>,
}

impl Scheduler {
    pub(crate) fn new(engine: EventStructure, n_threads: usize) -> Scheduler {
        Scheduler {
            inner: Mutex::new(Inner {
                engine,
                state: vec![ThreadState::Ready; n_threads],
                active: 0,
                abort: false,
                failure: None,
            }),
            cv: Condvar::new(),
            rng: Mutex::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    /// Reset per-schedule state and prime the engine for the next run.
    pub(crate) fn prepare(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.engine.initialize_exploration();
        for state in inner.state.iter_mut() {
            *state = ThreadState::Ready;
        }
        inner.active = 0;
        inner.abort = false;
        inner.failure = None;
        self.cv.notify_all();
    }

    /// Abort the in-flight schedule; workers unwind at their next
    /// interception.
    pub(crate) fn abort(&self, failure: Failure) {
        let mut inner = self.inner.lock().unwrap();
        info!(%failure, "abort schedule");
        if inner.failure.is_none() {
            inner.failure = Some(failure);
        }
        inner.abort = true;
        self.cv.notify_all();
    }

    pub(crate) fn take_failure(&self) -> Option<Failure> {
        self.inner.lock().unwrap().failure.take()
    }

    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut EventStructure) -> R) -> R {
        f(&mut self.inner.lock().unwrap().engine)
    }

    // Unwinding out of an aborted schedule must not poison the schedule
    // lock, so the guard is released before the panic.
    fn unwind_aborted(inner: std::sync::MutexGuard<'_, Inner>) -> ! {
        drop(inner);
        panic::panic_any(ExplorationAborted);
    }

    fn may_run(inner: &Inner, thread: usize) -> bool {
        if inner.engine.in_replay_phase() {
            inner.engine.replay_thread().map(ThreadId::as_usize) == Some(thread)
        } else {
            inner.active == thread
        }
    }

    fn schedulable(inner: &Inner, thread: usize) -> bool {
        match inner.state[thread] {
            ThreadState::Ready => true,
            ThreadState::Blocked(request) => inner.engine.unblocking_recorded(request),
            ThreadState::Finished => false,
        }
    }

    /// Hand the seat to the next schedulable thread; if none exists and
    /// someone is still blocked, the schedule has deadlocked.
    fn reschedule(&self, inner: &mut Inner, from: usize) {
        if inner.engine.in_replay_phase() {
            return;
        }

        let n = inner.state.len();
        for offset in 1..=n {
            let thread = (from + offset) % n;
            if Self::schedulable(inner, thread) {
                if thread != inner.active {
                    debug!(from, to = thread, "switch");
                }
                inner.active = thread;
                return;
            }
        }

        let blocked: Vec<usize> = inner
            .state
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, ThreadState::Blocked(_)))
            .map(|(i, _)| i)
            .collect();

        if !blocked.is_empty() {
            if inner.failure.is_none() {
                inner.failure = Some(Failure::Deadlock { threads: blocked });
            }
            inner.abort = true;
        }
    }

    /// Run one append under the gate, spinning on replay switch requests
    /// until this thread holds the seat.
    fn run_op(&self, thread: usize, mut f: impl FnMut(&mut EventStructure) -> Step) -> EventId {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.abort {
                Self::unwind_aborted(inner);
            }

            if !Self::may_run(&inner, thread) {
                inner = self.cv.wait(inner).unwrap();
                continue;
            }

            match f(&mut inner.engine) {
                Step::Event(event) => {
                    if !inner.engine.in_replay_phase() {
                        inner.active = thread;
                    }
                    self.cv.notify_all();
                    return event;
                }
                Step::Switch(_) => {
                    self.cv.notify_all();
                    inner = self.cv.wait(inner).unwrap();
                }
            }
        }
    }

    /// Drive the response protocol for a blocking request, parking the
    /// thread while the request dangles.
    fn await_response(&self, thread: usize, request: EventId) -> EventId {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.abort {
                Self::unwind_aborted(inner);
            }

            if !Self::may_run(&inner, thread) {
                inner = self.cv.wait(inner).unwrap();
                continue;
            }

            match inner.engine.add_response_events(request) {
                ResponseStep::Response(event) => {
                    inner.state[thread] = ThreadState::Ready;
                    if !inner.engine.in_replay_phase() {
                        inner.active = thread;
                    }
                    self.cv.notify_all();
                    return event;
                }
                ResponseStep::Switch(_) => {
                    self.cv.notify_all();
                    inner = self.cv.wait(inner).unwrap();
                }
                ResponseStep::NoResponse => {
                    inner.state[thread] = ThreadState::Blocked(request);
                    self.reschedule(&mut inner, thread);
                    self.cv.notify_all();
                    // The reschedule may just have declared this a deadlock;
                    // nobody else is left to wake us for the abort check.
                    if inner.abort {
                        Self::unwind_aborted(inner);
                    }
                    inner = self.cv.wait(inner).unwrap();
                }
            }
        }
    }

    /// Yield the seat voluntarily (spin bound).
    fn relinquish(&self, thread: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.abort {
            Self::unwind_aborted(inner);
        }
        self.reschedule(&mut inner, thread);
        self.cv.notify_all();
    }

    // ===== interception operations =====

    pub(crate) fn shared_read(
        &self,
        thread: usize,
        heap: &SimHeap,
        location: &MemoryLocation,
        ordering: Ordering,
        code: CodeLocation,
    ) -> Value {
        let request = self.run_op(thread, |e| {
            e.add_read_request(
                ThreadId::from_usize(thread),
                location.clone(),
                ordering,
                false,
                code,
            )
        });
        let response = self.await_response(thread, request);

        let (value, spin) = self.finish_read(response);

        // Keep the live heap in step with the chosen execution.
        let _ = location.write(heap, value.clone());

        if spin {
            self.relinquish(thread);
        }

        value
    }

    fn finish_read(&self, response: EventId) -> (Value, bool) {
        let mut inner = self.inner.lock().unwrap();
        let value_id = inner.engine.store()[response]
            .label
            .read_value()
            .expect("[weft internal bug] read response without a value");
        let value = inner
            .engine
            .get_value(value_id)
            .expect("[weft internal bug] unmapped value id in read response");
        let spin = inner.engine.take_spin_signal();
        (value, spin)
    }

    pub(crate) fn shared_write(
        &self,
        thread: usize,
        heap: &SimHeap,
        location: &MemoryLocation,
        value: Value,
        ordering: Ordering,
        code: CodeLocation,
    ) {
        self.run_op(thread, |e| {
            let value_id = e.compute_value_id(&value);
            e.add_write(
                ThreadId::from_usize(thread),
                location.clone(),
                value_id,
                ordering,
                false,
                None,
                code,
            )
        });

        let _ = location.write(heap, value);
    }

    /// Exclusive read + dependent write, paired through `source`.
    pub(crate) fn read_modify_write(
        &self,
        thread: usize,
        heap: &SimHeap,
        location: &MemoryLocation,
        f: &dyn Fn(Value) -> Value,
        ordering: Ordering,
        code: CodeLocation,
    ) -> Value {
        let request = self.run_op(thread, |e| {
            e.add_read_request(
                ThreadId::from_usize(thread),
                location.clone(),
                ordering,
                true,
                code,
            )
        });
        let response = self.await_response(thread, request);
        let (old, spin) = self.finish_read(response);

        let new = f(old.clone());

        self.run_op(thread, |e| {
            let value_id = e.compute_value_id(&new);
            e.add_write(
                ThreadId::from_usize(thread),
                location.clone(),
                value_id,
                ordering,
                true,
                Some(response),
                code,
            )
        });

        let _ = location.write(heap, new);

        if spin {
            self.relinquish(thread);
        }

        old
    }

    pub(crate) fn allocate(&self, thread: usize, heap: &SimHeap, cell: ObjRef) -> Value {
        let snapshot = CellSnapshot::new(&cell, heap.class_table());
        let memory_init =
            crate::rt::label::MemoryInit::new(std::sync::Arc::new(snapshot));
        let class_name = cell.class_name().to_string();

        let mut inner = self.inner.lock().unwrap();
        let (event, object_id) = loop {
            if inner.abort {
                Self::unwind_aborted(inner);
            }

            if !Self::may_run(&inner, thread) {
                inner = self.cv.wait(inner).unwrap();
                continue;
            }

            match inner.engine.add_object_allocation(
                ThreadId::from_usize(thread),
                &class_name,
                memory_init.clone(),
            ) {
                AllocationStep::Allocated { event, object_id } => break (event, object_id),
                AllocationStep::Switch(_) => {
                    self.cv.notify_all();
                    inner = self.cv.wait(inner).unwrap();
                }
            }
        };

        inner.engine.registry_mut().rebind(object_id, cell.clone(), event);
        if !inner.engine.in_replay_phase() {
            inner.active = thread;
        }
        self.cv.notify_all();
        drop(inner);

        heap.insert(object_id, cell.clone());
        Value::Object(cell)
    }

    pub(crate) fn lock_acquire(
        &self,
        thread: usize,
        mutex: ObjectId,
        reentry: bool,
        depth: usize,
        synthetic: bool,
    ) {
        let request = self.run_op(thread, |e| {
            e.add_lock_request(ThreadId::from_usize(thread), mutex, reentry, depth, synthetic)
        });
        self.await_response(thread, request);
    }

    pub(crate) fn lock_release(
        &self,
        thread: usize,
        mutex: ObjectId,
        reentry: bool,
        depth: usize,
        synthetic: bool,
    ) {
        self.run_op(thread, |e| {
            e.add_unlock(ThreadId::from_usize(thread), mutex, reentry, depth, synthetic)
        });
    }

    /// The wait protocol: synthetic release, wait for a notification, then
    /// synthetic reacquire at the saved depth.
    pub(crate) fn wait_on(&self, thread: usize, mutex: ObjectId, depth: usize) {
        self.lock_release(thread, mutex, false, depth, true);

        let request = self
            .run_op(thread, |e| e.add_wait_request(ThreadId::from_usize(thread), mutex));
        self.await_response(thread, request);

        self.lock_acquire(thread, mutex, false, depth, true);
    }

    pub(crate) fn notify(&self, thread: usize, mutex: ObjectId, broadcast: bool) {
        self.run_op(thread, |e| {
            e.add_notify(ThreadId::from_usize(thread), mutex, broadcast)
        });
    }

    pub(crate) fn park(&self, thread: usize) {
        let request = self.run_op(thread, |e| e.add_park_request(ThreadId::from_usize(thread)));
        self.await_response(thread, request);
    }

    pub(crate) fn unpark(&self, thread: usize, target: usize) {
        self.run_op(thread, |e| {
            e.add_unpark(ThreadId::from_usize(thread), ThreadId::from_usize(target))
        });
    }

    pub(crate) fn fork(&self, thread: usize, threads: BTreeSet<ThreadId>) {
        self.run_op(thread, |e| {
            e.add_thread_fork(ThreadId::from_usize(thread), threads.clone())
        });
    }

    pub(crate) fn join(&self, thread: usize, threads: BTreeSet<ThreadId>) {
        let request = self.run_op(thread, |e| {
            e.add_thread_join_request(ThreadId::from_usize(thread), threads.clone())
        });
        self.await_response(thread, request);
    }

    pub(crate) fn start_thread(&self, thread: usize) {
        let request = self.run_op(thread, |e| {
            e.add_thread_start_request(ThreadId::from_usize(thread))
        });
        self.await_response(thread, request);
    }

    pub(crate) fn finish_thread(&self, thread: usize) {
        self.run_op(thread, |e| e.add_thread_finish(ThreadId::from_usize(thread)));

        let mut inner = self.inner.lock().unwrap();
        inner.state[thread] = ThreadState::Finished;
        self.reschedule(&mut inner, thread);
        self.cv.notify_all();
    }

    pub(crate) fn actor_begin(&self, thread: usize, actor: usize) {
        self.run_op(thread, |e| {
            e.add_actor_span(ThreadId::from_usize(thread), SpanKind::Start, actor)
        });
    }

    pub(crate) fn actor_end(&self, thread: usize, actor: usize) {
        self.run_op(thread, |e| {
            e.add_actor_span(ThreadId::from_usize(thread), SpanKind::End, actor)
        });
    }

    pub(crate) fn random(&self, thread: usize) -> u64 {
        let candidate = {
            let mut rng = self.rng.lock().unwrap();
            // xorshift64*
            *rng ^= *rng << 13;
            *rng ^= *rng >> 7;
            *rng ^= *rng << 17;
            *rng
        };

        let event =
            self.run_op(thread, |e| e.add_random(ThreadId::from_usize(thread), candidate));

        self.with_engine(|e| match e.store()[event].label {
            crate::rt::label::EventLabel::Random { value } => value,
            _ => unreachable!("[weft internal bug] non-random replayed for random"),
        })
    }

    /// Returns `true` if the suspension was cancelled rather than resumed.
    pub(crate) fn coroutine_suspend(
        &self,
        thread: usize,
        actor: usize,
        prompt_cancellation: bool,
    ) -> bool {
        let request = self.run_op(thread, |e| {
            e.add_coroutine_suspend_request(ThreadId::from_usize(thread), actor, prompt_cancellation)
        });
        let response = self.await_response(thread, request);

        self.with_engine(|e| match e.store()[response].label {
            crate::rt::label::EventLabel::CoroutineSuspend { cancelled, .. } => cancelled,
            _ => unreachable!("[weft internal bug] non-suspend response"),
        })
    }

    pub(crate) fn coroutine_resume(&self, thread: usize, target: usize, actor: usize) {
        self.run_op(thread, |e| {
            e.add_coroutine_resume(
                ThreadId::from_usize(thread),
                ThreadId::from_usize(target),
                actor,
            )
        });
    }

}

impl fmt::Debug for Scheduler {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Scheduler").finish()
    }
}
