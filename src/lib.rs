#![deny(missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/weft/0.1.0")]

//! Weft is a tool for testing concurrent programs under a relaxed memory
//! model.
//!
//! At a high level, it drives a test scenario many times over, exploring the
//! executions that are valid under a relaxed memory model. Instead of
//! permuting thread schedules, weft incrementally builds an *event
//! structure*: a partial order of thread actions plus the synchronizations
//! between them. Every place where a read could have returned another write,
//! or a lock could have been handed to another thread, becomes a
//! *backtracking point*; exploration is a depth-first walk over those
//! alternatives.
//!
//! # Background
//!
//! Testing concurrent programs is challenging: some interleavings and some
//! weak-memory behaviors are so rare that running a test millions of times
//! never produces them, and on strongly-ordered hardware no amount of
//! iteration will exhibit a reordering at all. Weft explores the alternatives
//! deterministically. Each candidate execution is replayed from a stored
//! event order, extended with fresh events, and checked for memory-model
//! consistency, deadlocks and scenario invariants.
//!
//! # Writing scenarios
//!
//! A scenario is a fixed set of threads, each a sequence of actors. Shared
//! state is accessed through the interception entry points in [`intercept`],
//! exactly the calls an instrumentation pass would inject:
//!
//! ```no_run
//! use weft::rt::memory::{ClassDescriptor, MemoryLocation};
//! use weft::{code_location, Scenario};
//! use std::sync::atomic::Ordering::Relaxed;
//!
//! let x = MemoryLocation::static_field("Counter", "value");
//! let read = {
//!     let x = x.clone();
//!     move || {
//!         let v = weft::intercept::on_shared_read(&x, Relaxed, code_location!());
//!         let v = v.as_i32().unwrap() + 1;
//!         weft::intercept::on_shared_write(&x, v.into(), Relaxed, code_location!());
//!     }
//! };
//!
//! weft::model(
//!     Scenario::new()
//!         .class(ClassDescriptor::new("Counter").field_i32("value"))
//!         .spawn("inc", read.clone())
//!         .spawn("inc", read),
//! );
//! ```
//!
//! Scenarios must be deterministic apart from the sources of nondeterminism
//! weft models: shared-memory accesses, monitors, park/unpark, wait/notify,
//! thread lifecycle and [`intercept::on_random`]. The checker replays stored
//! executions verbatim; anything else that varies between runs diverges the
//! replay and is reported as a bug.
//!
//! # Exploration
//!
//! Exploration continues until the backtracking stack is exhausted or a
//! failure is found: a memory-model inconsistency, a deadlock, an unexpected
//! panic, a timeout, or a rejected scenario invariant. [`model`] panics on
//! the first failure; [`Builder::check`](model::Builder::check) returns it.

pub mod intercept;
pub mod model;
pub mod rt;
pub mod scenario;

pub use crate::model::{model, Builder, Report};
pub use crate::scenario::{actor, Actor, Scenario};

pub use crate::rt::MAX_THREADS;
