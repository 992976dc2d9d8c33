#![deny(warnings, rust_2018_idioms)]

use weft::intercept::{on_shared_read, on_shared_write};
use weft::rt::consistency::NoChecker;
use weft::rt::memory::{ClassDescriptor, ClassTable, MemoryLocation, TableInit};
use weft::rt::{
    EngineConfig, EventStructure, MemoryInit, ResponseStep, Step, ThreadId, DEFAULT_SPIN_BOUND,
};
use weft::{code_location, Builder, Scenario};

use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

/// One writer, one unbounded reader loop: the spin bound forces a switch to
/// the writer and the reader's next read observes the new value, so every
/// exploration terminates.
#[test]
fn spin_loop_terminates() {
    let flag = MemoryLocation::static_field("Spin", "flag");
    let iterations = Arc::new(Mutex::new(Vec::new()));

    let reader = {
        let flag = flag.clone();
        let iterations = iterations.clone();
        move || {
            let mut spins = 0usize;
            loop {
                let v = on_shared_read(&flag, Relaxed, code_location!())
                    .as_i32()
                    .unwrap();
                if v == 1 {
                    break;
                }
                spins += 1;
            }
            iterations.lock().unwrap().push(spins);
        }
    };

    let writer = {
        let flag = flag.clone();
        move || on_shared_write(&flag, 1.into(), Relaxed, code_location!())
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Spin").field_i32("flag"))
        .spawn("reader", reader)
        .spawn("writer", writer);

    let report = Builder::new().check(&scenario).unwrap();
    let iterations = iterations.lock().unwrap();

    assert_eq!(iterations.len(), report.explorations);
    // No exploration spins past the bound plus the final successful read.
    assert!(
        iterations.iter().all(|&n| n <= DEFAULT_SPIN_BOUND + 1),
        "iterations = {:?}",
        *iterations
    );
}

fn engine() -> EventStructure {
    let mut classes = ClassTable::new();
    classes.register(ClassDescriptor::new("Spin").field_i32("x"));

    EventStructure::new(
        MemoryInit::new(Arc::new(TableInit::new(Arc::new(classes)))),
        Box::new(NoChecker),
        EngineConfig::default(),
    )
}

/// Spin-bound idempotence: identical reads at one code location signal a
/// switch from the bound onwards, and once saturated the engine refuses to
/// extend the spin with further identical responses.
#[test]
fn spin_bound_signals_switch() {
    let mut engine = engine();
    engine.initialize_exploration();

    let x = MemoryLocation::static_field("Spin", "x");
    let thread = ThreadId::from_usize(0);
    let code = code_location!();

    for hit in 1..=DEFAULT_SPIN_BOUND {
        let request = match engine.add_read_request(thread, x.clone(), Relaxed, false, code) {
            Step::Event(request) => request,
            step => panic!("unexpected step {:?}", step),
        };
        match engine.add_response_events(request) {
            ResponseStep::Response(_) => {}
            step => panic!("unexpected step {:?}", step),
        }

        let signalled = engine.take_spin_signal();
        assert_eq!(
            signalled,
            hit >= DEFAULT_SPIN_BOUND,
            "hit {} signalled {}",
            hit,
            signalled
        );
    }

    // Saturated: the next identical read cannot be answered again.
    let request = match engine.add_read_request(thread, x.clone(), Relaxed, false, code) {
        Step::Event(request) => request,
        step => panic!("unexpected step {:?}", step),
    };
    assert_eq!(engine.add_response_events(request), ResponseStep::NoResponse);
}
