//! Entry points for instrumented code.
//!
//! An instrumentation pass (or a hand-written scenario) calls these on every
//! shared access, monitor operation, park, fork and so on. Each resolves the
//! calling model thread through a scoped thread-local installed by the
//! driver, then enters the engine under the schedule lock.

use crate::rt::location::CodeLocation;
use crate::rt::memory::{MemoryLocation, SimHeap};
use crate::rt::object::ObjectCell;
use crate::rt::scheduler::Scheduler;
use crate::rt::value::{ObjectId, Value};
use crate::rt::ThreadId;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use scoped_tls::scoped_thread_local;

pub(crate) struct ThreadContext {
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) heap: Arc<SimHeap>,
    pub(crate) thread: usize,
    /// Monitor re-entrancy depths, tracked per thread.
    pub(crate) lock_depths: RefCell<HashMap<ObjectId, usize>>,
    pub(crate) actor: Cell<usize>,
}

scoped_thread_local! {
    pub(crate) static CONTEXT: ThreadContext
}

fn with_ctx<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
    if !CONTEXT.is_set() {
        panic!(
            "cannot access the weft engine from outside a model thread. \
             are you calling an interception entry point outside of a scenario \
             (a call to `model` or `check`)?"
        )
    }
    CONTEXT.with(f)
}

/// Index of the calling model thread.
pub fn current_thread() -> usize {
    with_ctx(|ctx| ctx.thread)
}

pub fn on_shared_read(location: &MemoryLocation, ordering: Ordering, code: CodeLocation) -> Value {
    with_ctx(|ctx| {
        ctx.scheduler
            .shared_read(ctx.thread, &ctx.heap, location, ordering, code)
    })
}

pub fn on_shared_write(
    location: &MemoryLocation,
    value: Value,
    ordering: Ordering,
    code: CodeLocation,
) {
    with_ctx(|ctx| {
        ctx.scheduler
            .shared_write(ctx.thread, &ctx.heap, location, value, ordering, code)
    })
}

/// Atomic read-modify-write; returns the previous value.
pub fn on_read_modify_write(
    location: &MemoryLocation,
    f: impl Fn(Value) -> Value,
    ordering: Ordering,
    code: CodeLocation,
) -> Value {
    with_ctx(|ctx| {
        ctx.scheduler
            .read_modify_write(ctx.thread, &ctx.heap, location, &f, ordering, code)
    })
}

pub fn on_allocation(class_name: &str) -> Value {
    with_ctx(|ctx| {
        let cell = ObjectCell::new(class_name);
        ctx.scheduler.allocate(ctx.thread, &ctx.heap, cell)
    })
}

pub fn on_array_allocation(class_name: &str, len: usize, fill: Value) -> Value {
    with_ctx(|ctx| {
        let cell = ObjectCell::array(class_name, len, fill);
        ctx.scheduler.allocate(ctx.thread, &ctx.heap, cell)
    })
}

pub fn on_atomic_allocation(class_name: &str, initial: Value) -> Value {
    with_ctx(|ctx| {
        let cell = ObjectCell::new(class_name);
        cell.set_atomic_value(initial);
        ctx.scheduler.allocate(ctx.thread, &ctx.heap, cell)
    })
}

/// Engine-side identity of a live object, for forming field and element
/// locations. Unknown objects register as external.
pub fn object_id(value: &Value) -> ObjectId {
    with_ctx(|ctx| object_id_of(ctx, value))
}

fn object_id_of(ctx: &ThreadContext, value: &Value) -> ObjectId {
    match ctx
        .scheduler
        .with_engine(|e| e.compute_value_id(value))
        .object_id()
    {
        Some(id) => id,
        None => panic!("monitor operations need an object, got {:?}", value),
    }
}

pub fn on_lock_acquire(mutex: &Value) {
    with_ctx(|ctx| {
        let id = object_id_of(ctx, mutex);
        let depth = {
            let mut depths = ctx.lock_depths.borrow_mut();
            let depth = depths.entry(id).or_insert(0);
            let held = *depth;
            *depth += 1;
            held
        };

        ctx.scheduler
            .lock_acquire(ctx.thread, id, depth > 0, depth, false);
    })
}

pub fn on_lock_release(mutex: &Value) {
    with_ctx(|ctx| {
        let id = object_id_of(ctx, mutex);
        let depth = {
            let mut depths = ctx.lock_depths.borrow_mut();
            let depth = depths
                .get_mut(&id)
                .expect("releasing a monitor that is not held");
            assert!(*depth > 0, "releasing a monitor that is not held");
            *depth -= 1;
            *depth
        };

        ctx.scheduler
            .lock_release(ctx.thread, id, depth > 0, depth, false);
    })
}

/// Monitor wait: releases the monitor in full, waits for a notification,
/// reacquires at the saved depth.
pub fn on_wait(mutex: &Value) {
    with_ctx(|ctx| {
        let id = object_id_of(ctx, mutex);
        let depth = *ctx
            .lock_depths
            .borrow()
            .get(&id)
            .expect("waiting on a monitor that is not held");
        assert!(depth > 0, "waiting on a monitor that is not held");

        ctx.scheduler.wait_on(ctx.thread, id, depth - 1);
    })
}

pub fn on_notify(mutex: &Value) {
    with_ctx(|ctx| {
        let id = object_id_of(ctx, mutex);
        ctx.scheduler.notify(ctx.thread, id, false);
    })
}

pub fn on_notify_all(mutex: &Value) {
    with_ctx(|ctx| {
        let id = object_id_of(ctx, mutex);
        ctx.scheduler.notify(ctx.thread, id, true);
    })
}

/// Block until another thread posts an unpark token for this thread.
pub fn on_park() {
    with_ctx(|ctx| ctx.scheduler.park(ctx.thread))
}

pub fn on_unpark(target: usize) {
    with_ctx(|ctx| ctx.scheduler.unpark(ctx.thread, target))
}

/// First action of a model thread: blocks until its fork (or the root, for
/// the main thread) is part of the execution.
pub fn on_thread_start() {
    with_ctx(|ctx| ctx.scheduler.start_thread(ctx.thread))
}

/// Last action of a model thread; unblocks pending joins on it.
pub fn on_thread_finish() {
    with_ctx(|ctx| ctx.scheduler.finish_thread(ctx.thread))
}

/// Announce the threads the caller is about to bring up.
pub fn on_thread_fork(threads: impl IntoIterator<Item = usize>) {
    with_ctx(|ctx| {
        let threads: BTreeSet<ThreadId> = threads.into_iter().map(ThreadId::from_usize).collect();
        if threads.is_empty() {
            return;
        }
        ctx.scheduler.fork(ctx.thread, threads)
    })
}

/// Block until every listed thread has finished.
pub fn on_thread_join(threads: impl IntoIterator<Item = usize>) {
    with_ctx(|ctx| {
        let threads: BTreeSet<ThreadId> = threads.into_iter().map(ThreadId::from_usize).collect();
        if threads.is_empty() {
            return;
        }
        ctx.scheduler.join(ctx.thread, threads)
    })
}

/// Open an actor span; panics until the matching end are attributed to this
/// actor.
pub fn on_actor_start(actor: usize) {
    with_ctx(|ctx| {
        ctx.actor.set(actor);
        ctx.scheduler.actor_begin(ctx.thread, actor)
    })
}

pub fn on_actor_end(actor: usize) {
    with_ctx(|ctx| ctx.scheduler.actor_end(ctx.thread, actor))
}

/// Replay-stable source of nondeterminism.
pub fn on_random() -> u64 {
    with_ctx(|ctx| ctx.scheduler.random(ctx.thread))
}

/// Cooperative suspension; returns `true` if the suspension was cancelled.
pub fn on_coroutine_suspend(prompt_cancellation: bool) -> bool {
    with_ctx(|ctx| {
        ctx.scheduler
            .coroutine_suspend(ctx.thread, ctx.actor.get(), prompt_cancellation)
    })
}

pub fn on_coroutine_resume(target: usize, actor: usize) {
    with_ctx(|ctx| ctx.scheduler.coroutine_resume(ctx.thread, target, actor))
}
