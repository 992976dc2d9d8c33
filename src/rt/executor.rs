use std::any::Any;
use std::fmt;
use std::hint;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

const IDLE: u8 = 0;
const SUBMITTED: u8 = 1;
const RUNNING: u8 = 2;
const DONE: u8 = 3;
const PANICKED: u8 = 4;

#[derive(Debug, Error)]
#[error("executor tasks did not complete within {0:?}")]
pub struct ExecutorTimeout(pub Duration);

struct Slot {
    state: AtomicU8,
    task: Mutex<Option<Task>>,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            state: AtomicU8::new(IDLE),
            task: Mutex::new(None),
            panic: Mutex::new(None),
        }
    }
}

struct Shared {
    slots: Vec<Slot>,
    shutdown: AtomicBool,
}

/// A fixed set of busy-waiting worker threads, one per model thread.
///
/// Reusable across schedules: `submit_and_await` first waits for every
/// worker to drain back to idle, publishes one task per worker, then
/// busy-waits for all completions or the timeout. A task panic is rethrown
/// from the caller, including one raised by a straggler after its submission
/// timed out; a timeout leaves the stragglers running and they surface on
/// the drain instead of blocking this submission forever.
pub struct FixedActiveThreadsExecutor {
    shared: Arc<Shared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl FixedActiveThreadsExecutor {
    pub fn new(name: &str, n_threads: usize) -> FixedActiveThreadsExecutor {
        let shared = Arc::new(Shared {
            slots: (0..n_threads).map(|_| Slot::new()).collect(),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..n_threads)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, index))
                    .spawn(move || worker_loop(shared, index))
                    .expect("failed to spawn executor worker")
            })
            .collect();

        FixedActiveThreadsExecutor { shared, handles }
    }

    pub fn n_threads(&self) -> usize {
        self.shared.slots.len()
    }

    /// Run one task per worker, waiting up to `timeout` for all of them.
    pub fn submit_and_await(
        &self,
        tasks: Vec<Task>,
        timeout: Duration,
    ) -> Result<(), ExecutorTimeout> {
        assert_eq!(
            tasks.len(),
            self.shared.slots.len(),
            "one task per worker thread"
        );

        self.wait_idle();

        for (slot, task) in self.shared.slots.iter().zip(tasks) {
            *slot.task.lock().unwrap() = Some(task);
            slot.state.store(SUBMITTED, Ordering::Release);
        }

        let deadline = Instant::now() + timeout;

        loop {
            let mut done = true;

            for slot in &self.shared.slots {
                match slot.state.load(Ordering::Acquire) {
                    DONE => {}
                    PANICKED => {
                        let payload = slot
                            .panic
                            .lock()
                            .unwrap()
                            .take()
                            .expect("[weft internal bug] panicked slot without payload");
                        slot.state.store(IDLE, Ordering::Release);
                        resume_unwind(payload);
                    }
                    _ => done = false,
                }
            }

            if done {
                for slot in &self.shared.slots {
                    slot.state.store(IDLE, Ordering::Release);
                }
                return Ok(());
            }

            if Instant::now() >= deadline {
                trace!("executor timeout");
                // Completed workers go back to idle; stragglers drain later.
                for slot in &self.shared.slots {
                    let _ = slot.state.compare_exchange(
                        DONE,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                return Err(ExecutorTimeout(timeout));
            }

            hint::spin_loop();
            thread::yield_now();
        }
    }

    /// Busy-wait until every worker is back in the idle state.
    ///
    /// A straggler that panicked after its submission already timed out is
    /// still a task error: the payload is rethrown from here, not discarded.
    pub fn wait_idle(&self) {
        loop {
            let mut idle = true;
            for slot in &self.shared.slots {
                match slot.state.load(Ordering::Acquire) {
                    IDLE => {}
                    DONE => {
                        slot.state.store(IDLE, Ordering::Release);
                    }
                    PANICKED => {
                        let payload = slot
                            .panic
                            .lock()
                            .unwrap()
                            .take()
                            .expect("[weft internal bug] panicked slot without payload");
                        slot.state.store(IDLE, Ordering::Release);
                        resume_unwind(payload);
                    }
                    _ => idle = false,
                }
            }
            if idle {
                return;
            }
            hint::spin_loop();
            thread::yield_now();
        }
    }
}

impl Drop for FixedActiveThreadsExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for FixedActiveThreadsExecutor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FixedActiveThreadsExecutor")
            .field("n_threads", &self.shared.slots.len())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let slot = &shared.slots[index];

    loop {
        match slot.state.load(Ordering::Acquire) {
            SUBMITTED => {
                let task = slot
                    .task
                    .lock()
                    .unwrap()
                    .take()
                    .expect("[weft internal bug] submitted slot without task");
                slot.state.store(RUNNING, Ordering::Release);

                trace!(worker = index, "task start");

                match catch_unwind(AssertUnwindSafe(task)) {
                    Ok(()) => slot.state.store(DONE, Ordering::Release),
                    Err(payload) => {
                        *slot.panic.lock().unwrap() = Some(payload);
                        slot.state.store(PANICKED, Ordering::Release);
                    }
                }

                trace!(worker = index, "task done");
            }
            _ => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                hint::spin_loop();
                thread::yield_now();
            }
        }
    }
}
