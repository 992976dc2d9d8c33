#![deny(warnings, rust_2018_idioms)]

use weft::rt::FixedActiveThreadsExecutor;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send>;

fn task(f: impl FnOnce() + Send + 'static) -> Task {
    Box::new(f)
}

/// A task that outlives the deadline raises a timeout; once it drains, the
/// same pool accepts the next submission.
#[test]
fn submit_timeout_then_reuse() {
    let pool = FixedActiveThreadsExecutor::new("timeout-pool", 2);
    let stop = Arc::new(AtomicBool::new(false));

    let tasks = vec![
        task(|| {}),
        task({
            let stop = stop.clone();
            move || {
                while !stop.load(SeqCst) {
                    std::thread::yield_now();
                }
            }
        }),
    ];

    pool.submit_and_await(tasks, Duration::from_millis(200))
        .expect_err("the spinning task must trip the timeout");

    // Let the straggler drain, then the pool is reusable.
    stop.store(true, SeqCst);

    let done = Arc::new(AtomicUsize::new(0));
    let tasks = (0..2)
        .map(|_| {
            let done = done.clone();
            task(move || {
                done.fetch_add(1, SeqCst);
            })
        })
        .collect();

    pool.submit_and_await(tasks, Duration::from_secs(5)).unwrap();
    assert_eq!(done.load(SeqCst), 2);
}

/// A panic raised by a straggler after its submission already timed out is
/// not swallowed: draining the pool rethrows it.
#[test]
fn straggler_panic_rethrown_on_drain() {
    let pool = FixedActiveThreadsExecutor::new("straggler-pool", 2);
    let release = Arc::new(AtomicBool::new(false));

    let tasks = vec![
        task(|| {}),
        task({
            let release = release.clone();
            move || {
                while !release.load(SeqCst) {
                    std::thread::yield_now();
                }
                panic!("late failure");
            }
        }),
    ];

    pool.submit_and_await(tasks, Duration::from_millis(100))
        .expect_err("the stalled task must trip the timeout");

    // The straggler now panics, well past the deadline.
    release.store(true, SeqCst);

    let result = catch_unwind(AssertUnwindSafe(|| pool.wait_idle()));
    let payload = result.expect_err("the straggler panic must resurface");
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("late failure"));

    // Drained and reusable.
    let tasks = (0..2).map(|_| task(|| {})).collect();
    pool.submit_and_await(tasks, Duration::from_secs(5)).unwrap();
}

/// A task panic is rethrown from the submitting thread.
#[test]
fn task_panic_rethrown() {
    let pool = FixedActiveThreadsExecutor::new("panic-pool", 2);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let tasks = vec![task(|| panic!("task exploded")), task(|| {})];
        let _ = pool.submit_and_await(tasks, Duration::from_secs(5));
    }));

    let payload = result.expect_err("the panic must propagate");
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .unwrap_or("<non-string>");
    assert_eq!(message, "task exploded");

    // Still usable afterwards.
    let tasks = (0..2).map(|_| task(|| {})).collect();
    pool.submit_and_await(tasks, Duration::from_secs(5)).unwrap();
}

/// Workers return to idle between submissions.
#[test]
fn reusable_across_many_rounds() {
    let pool = FixedActiveThreadsExecutor::new("reuse-pool", 3);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let tasks = (0..3)
            .map(|_| {
                let counter = counter.clone();
                task(move || {
                    counter.fetch_add(1, SeqCst);
                })
            })
            .collect();

        pool.submit_and_await(tasks, Duration::from_secs(5)).unwrap();
    }

    assert_eq!(counter.load(SeqCst), 150);
}
