use crate::rt::consistency::Inconsistency;

use std::time::Duration;

use thiserror::Error;

/// Why the engine asked the strategy to put another thread in the driver's
/// seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Replay discipline: the stored order continues on a different thread.
    StrategySwitch,
    /// The spin-loop detector saturated at a code location.
    SpinBound,
}

/// A failed schedule or run.
///
/// Everything here aborts the current exploration; whether it aborts the
/// whole run is the driver's call.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("memory model inconsistency: {0}")]
    Inconsistency(#[from] Inconsistency),

    #[error("unexpected panic in thread {thread}, actor {actor}: {message}")]
    UnexpectedPanic {
        thread: usize,
        actor: usize,
        message: String,
    },

    #[error("execution did not complete within {0:?}")]
    Timeout(Duration),

    #[error("deadlock; blocked threads = {threads:?}")]
    Deadlock { threads: Vec<usize> },

    #[error("scenario invariant rejected the completed execution")]
    IncorrectResult,
}
