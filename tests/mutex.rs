#![deny(warnings, rust_2018_idioms)]

use weft::intercept::{
    on_lock_acquire, on_lock_release, on_notify, on_shared_read, on_shared_write, on_wait,
};
use weft::rt::memory::{ClassDescriptor, MemoryLocation};
use weft::rt::object::ObjectCell;
use weft::rt::Value;
use weft::{code_location, Builder, Scenario};

use std::collections::HashSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

/// Increments guarded by a monitor never lose an update: in no execution do
/// both threads read 0.
#[test]
fn monitor_guards_counter() {
    let x = MemoryLocation::static_field("Guarded", "value");
    let mutex = Value::Object(ObjectCell::new("java.lang.Object"));
    let slots = Arc::new(Mutex::new((0, 0)));
    let observed = Arc::new(Mutex::new(HashSet::new()));

    let inc = |slot: usize| {
        let x = x.clone();
        let mutex = mutex.clone();
        let slots = slots.clone();
        move || {
            on_lock_acquire(&mutex);

            let v = on_shared_read(&x, Relaxed, code_location!())
                .as_i32()
                .unwrap();
            on_shared_write(&x, (v + 1).into(), Relaxed, code_location!());

            on_lock_release(&mutex);

            let mut slots = slots.lock().unwrap();
            if slot == 0 {
                slots.0 = v;
            } else {
                slots.1 = v;
            }
        }
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Guarded").field_i32("value"))
        .spawn("inc", inc(0))
        .spawn("inc", inc(1))
        .invariant({
            let slots = slots.clone();
            let observed = observed.clone();
            move || {
                observed.lock().unwrap().insert(*slots.lock().unwrap());
                true
            }
        });

    let report = Builder::new().check(&scenario).unwrap();
    let observed = observed.lock().unwrap();

    assert!(report.explorations >= 2, "lock handoff alternatives explored");
    assert!(
        !observed.contains(&(0, 0)),
        "monitor failed to serialize the increments: {:?}",
        *observed
    );
    assert!(observed.contains(&(0, 1)) || observed.contains(&(1, 0)));
}

/// Reentrant acquisition synchronizes against the monitor's allocation and
/// releases pair back down without deadlocking.
#[test]
fn reentrant_monitor() {
    let mutex = Value::Object(ObjectCell::new("java.lang.Object"));

    let body = {
        let mutex = mutex.clone();
        move || {
            on_lock_acquire(&mutex);
            on_lock_acquire(&mutex);
            on_lock_release(&mutex);
            on_lock_release(&mutex);
        }
    };

    let scenario = Scenario::new()
        .spawn("outer", body.clone())
        .spawn("outer", body);

    Builder::new().check(&scenario).unwrap();
}

/// Wait releases the monitor so the notifier can acquire it; the waiter is
/// woken and reacquires.
#[test]
fn wait_notify() {
    let mutex = Value::Object(ObjectCell::new("java.lang.Object"));

    let waiter = {
        let mutex = mutex.clone();
        move || {
            on_lock_acquire(&mutex);
            on_wait(&mutex);
            on_lock_release(&mutex);
        }
    };

    let notifier = {
        let mutex = mutex.clone();
        move || {
            on_lock_acquire(&mutex);
            on_notify(&mutex);
            on_lock_release(&mutex);
        }
    };

    let scenario = Scenario::new()
        .spawn("waiter", waiter)
        .spawn("notifier", notifier);

    Builder::new().check(&scenario).unwrap();
}
