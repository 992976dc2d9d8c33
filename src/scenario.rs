//! Test scenarios: a fixed set of threads, each running a sequence of actors.

use crate::rt::memory::ClassDescriptor;
use crate::rt::MAX_THREADS;

use std::fmt;
use std::sync::Arc;

/// One operation of a scenario thread.
#[derive(Clone)]
pub struct Actor {
    pub(crate) name: String,
    pub(crate) body: Arc<dyn Fn() + Send + Sync>,
}

/// Build a named actor from a closure using the interception entry points.
pub fn actor(name: &str, body: impl Fn() + Send + Sync + 'static) -> Actor {
    Actor {
        name: name.to_string(),
        body: Arc::new(body),
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Actor({})", self.name)
    }
}

/// A complete test harness: classes, threads and an optional invariant
/// evaluated after every completed schedule.
///
/// The first thread doubles as the main thread: it forks the others before
/// its own actors and joins them after.
#[derive(Debug, Default, Clone)]
pub struct Scenario {
    pub(crate) threads: Vec<Vec<Actor>>,
    pub(crate) classes: Vec<ClassDescriptor>,
    pub(crate) invariant: Option<Invariant>,
}

#[derive(Clone)]
pub(crate) struct Invariant(pub(crate) Arc<dyn Fn() -> bool + Send + Sync>);

impl fmt::Debug for Invariant {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Invariant(..)")
    }
}

impl Scenario {
    pub fn new() -> Scenario {
        Scenario::default()
    }

    /// Declare a class shape used for field resolution and initial values.
    pub fn class(mut self, class: ClassDescriptor) -> Scenario {
        self.classes.push(class);
        self
    }

    /// Add a model thread running the given actors in order.
    pub fn thread(mut self, actors: Vec<Actor>) -> Scenario {
        assert!(
            self.threads.len() < MAX_THREADS,
            "a scenario supports at most {} threads",
            MAX_THREADS
        );
        self.threads.push(actors);
        self
    }

    /// Shorthand for a single-actor thread.
    pub fn spawn(self, name: &str, body: impl Fn() + Send + Sync + 'static) -> Scenario {
        self.thread(vec![actor(name, body)])
    }

    /// Predicate checked after every completed schedule; returning `false`
    /// fails the schedule with `Failure::IncorrectResult`.
    pub fn invariant(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Scenario {
        self.invariant = Some(Invariant(Arc::new(f)));
        self
    }

    pub fn n_threads(&self) -> usize {
        self.threads.len()
    }
}
