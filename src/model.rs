//! Model check concurrent scenarios.

use crate::intercept::{self, ThreadContext, CONTEXT};
use crate::rt::consistency::CoherenceChecker;
use crate::rt::engine::{EngineConfig, EventStructure};
use crate::rt::executor::{ExecutorTimeout, FixedActiveThreadsExecutor};
use crate::rt::failure::Failure;
use crate::rt::label::MemoryInit;
use crate::rt::memory::{ClassTable, SimHeap, TableInit};
use crate::rt::scheduler::{ExplorationAborted, Scheduler};
use crate::rt::{DEFAULT_SPIN_BOUND, MAX_THREADS};
use crate::scenario::Scenario;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, subscriber};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_MAX_EXPLORATIONS: usize = 10_000;
const DEFAULT_MAX_EVENTS: usize = 10_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Configure a model
#[derive(Debug)]
#[non_exhaustive] // Support adding more fields in the future
pub struct Builder {
    /// Maximum number of explorations (backtracking points) to drive.
    ///
    /// Defaults to `WEFT_MAX_EXPLORATIONS` environment variable.
    pub max_explorations: usize,

    /// Maximum amount of wall-clock time to spend on checking.
    ///
    /// Defaults to `WEFT_MAX_DURATION` environment variable (seconds).
    pub max_duration: Option<Duration>,

    /// Per-schedule timeout enforced by the worker pool.
    ///
    /// Defaults to `WEFT_TIMEOUT_MS` environment variable.
    pub timeout: Duration,

    /// Identical read responses at one code location before the engine
    /// signals a cooperative switch.
    ///
    /// Defaults to `WEFT_SPIN_BOUND` environment variable.
    pub spin_bound: usize,

    /// Hard cap on events per run.
    ///
    /// Defaults to `WEFT_MAX_EVENTS` environment variable.
    pub max_events: usize,

    /// Stop at the first failing schedule (the default). When `false`,
    /// failing schedules are recorded and exploration continues.
    pub fail_fast: bool,
}

impl Builder {
    /// Create a new `Builder` instance with default values.
    pub fn new() -> Builder {
        use std::env;

        let max_explorations = env::var("WEFT_MAX_EXPLORATIONS")
            .map(|v| {
                v.parse()
                    .expect("invalid value for `WEFT_MAX_EXPLORATIONS`")
            })
            .unwrap_or(DEFAULT_MAX_EXPLORATIONS);

        let max_duration = env::var("WEFT_MAX_DURATION")
            .map(|v| {
                let secs = v.parse().expect("invalid value for `WEFT_MAX_DURATION`");
                Duration::from_secs(secs)
            })
            .ok();

        let timeout = env::var("WEFT_TIMEOUT_MS")
            .map(|v| v.parse().expect("invalid value for `WEFT_TIMEOUT_MS`"))
            .map(Duration::from_millis)
            .unwrap_or_else(|_| Duration::from_millis(DEFAULT_TIMEOUT_MS));

        let spin_bound = env::var("WEFT_SPIN_BOUND")
            .map(|v| v.parse().expect("invalid value for `WEFT_SPIN_BOUND`"))
            .unwrap_or(DEFAULT_SPIN_BOUND);

        let max_events = env::var("WEFT_MAX_EVENTS")
            .map(|v| v.parse().expect("invalid value for `WEFT_MAX_EVENTS`"))
            .unwrap_or(DEFAULT_MAX_EVENTS);

        Builder {
            max_explorations,
            max_duration,
            timeout,
            spin_bound,
            max_events,
            fail_fast: true,
        }
    }

    /// Check the provided scenario, driving every exploration.
    pub fn check(&self, scenario: &Scenario) -> Result<Report, Failure> {
        let n = scenario.n_threads();
        assert!(n >= 1, "a scenario needs at least one thread");
        assert!(
            n <= MAX_THREADS,
            "a scenario supports at most {} threads",
            MAX_THREADS
        );

        let mut classes = ClassTable::new();
        for class in &scenario.classes {
            classes.register(class.clone());
        }

        let heap = Arc::new(SimHeap::new(classes));
        let memory_init = MemoryInit::new(Arc::new(TableInit::new(heap.class_table())));

        let engine = EventStructure::new(
            memory_init,
            Box::new(CoherenceChecker),
            EngineConfig {
                spin_bound: self.spin_bound,
                max_events: self.max_events,
            },
        );

        let scheduler = Arc::new(Scheduler::new(engine, n));
        let pool = FixedActiveThreadsExecutor::new("weft", n);

        let mut report = Report {
            explorations: 0,
            pruned: 0,
            failures: Vec::new(),
        };
        let start = Instant::now();

        loop {
            report.explorations += 1;
            let _span =
                tracing::info_span!(parent: None, "exploration", message = report.explorations)
                    .entered();

            let externals = scheduler.with_engine(|e| e.registry().external_entries());
            heap.reset(externals.into_iter());
            scheduler.prepare();

            let tasks = (0..n)
                .map(|thread| self.task(scenario, &scheduler, &heap, thread, n))
                .collect();

            if let Err(ExecutorTimeout(timeout)) = pool.submit_and_await(tasks, self.timeout) {
                scheduler.abort(Failure::Timeout(timeout));
                pool.wait_idle();
            }

            let mut failure = scheduler.take_failure();
            let mut pruned = false;

            if failure.is_none() {
                // An inconsistent execution is not a verdict about the code
                // under test: the schedule is invalid under the memory model
                // and is discarded, like a causality violation one level up.
                if let Some(inconsistency) = scheduler.with_engine(|e| e.check_consistency()) {
                    tracing::debug!(%inconsistency, "schedule pruned");
                    report.pruned += 1;
                    pruned = true;
                }
            }

            if failure.is_none() && !pruned {
                if let Some(invariant) = &scenario.invariant {
                    if !(invariant.0)() {
                        failure = Some(Failure::IncorrectResult);
                    }
                }
            }

            if pruned {
                scheduler.with_engine(|e| e.abort_exploration());
            }

            if let Some(failure) = failure {
                scheduler.with_engine(|e| e.abort_exploration());

                if self.fail_fast {
                    return Err(failure);
                }
                report.failures.push(failure);
            }

            if report.explorations >= self.max_explorations {
                info!(parent: None, "exploration bound reached");
                break;
            }

            if let Some(max_duration) = self.max_duration {
                if start.elapsed() >= max_duration {
                    info!(parent: None, "duration bound reached");
                    break;
                }
            }

            if !scheduler.with_engine(|e| e.start_next_exploration()) {
                info!(
                    parent: None,
                    "completed in {} explorations", report.explorations
                );
                break;
            }
        }

        Ok(report)
    }

    fn task(
        &self,
        scenario: &Scenario,
        scheduler: &Arc<Scheduler>,
        heap: &Arc<SimHeap>,
        thread: usize,
        n_threads: usize,
    ) -> Box<dyn FnOnce() + Send> {
        let actors = scenario.threads[thread].clone();
        let scheduler = scheduler.clone();
        let heap = heap.clone();

        Box::new(move || {
            let ctx = ThreadContext {
                scheduler: scheduler.clone(),
                heap,
                thread,
                lock_depths: RefCell::new(HashMap::new()),
                actor: Cell::new(0),
            };

            let others: Vec<usize> = (1..n_threads).collect();

            // The harness is instrumented code like any other: the whole
            // thread protocol goes through the interception entry points.
            let result = catch_unwind(AssertUnwindSafe(|| {
                CONTEXT.set(&ctx, || {
                    intercept::on_thread_start();

                    if thread == 0 {
                        intercept::on_thread_fork(others.iter().copied());
                    }

                    for (index, actor) in actors.iter().enumerate() {
                        intercept::on_actor_start(index);
                        (actor.body)();
                        intercept::on_actor_end(index);
                    }

                    if thread == 0 {
                        intercept::on_thread_join(others.iter().copied());
                    }

                    intercept::on_thread_finish();
                })
            }));

            if let Err(payload) = result {
                // Aborted schedules unwind silently; anything else is user
                // code failing outside its declared behavior.
                if payload.downcast_ref::<ExplorationAborted>().is_some() {
                    return;
                }

                scheduler.abort(Failure::UnexpectedPanic {
                    thread,
                    actor: ctx.actor.get(),
                    message: payload_message(&payload),
                });
            }
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome of a completed check.
#[derive(Debug)]
pub struct Report {
    /// Number of schedules driven.
    pub explorations: usize,
    /// Schedules discarded as inconsistent under the memory model.
    pub pruned: usize,
    /// Failing schedules recorded when not in fail-fast mode.
    pub failures: Vec<Failure>,
}

/// Explore every execution of the scenario, panicking on the first failure.
///
/// Uses a default [`Builder`](crate::model::Builder) which can be affected
/// by environment variables.
pub fn model(scenario: Scenario) {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_env("WEFT_LOG"))
        .with_test_writer()
        .without_time()
        .finish();

    subscriber::with_default(subscriber, || {
        if let Err(failure) = Builder::new().check(&scenario) {
            panic!("weft found a failing execution: {}", failure);
        }
    });
}
