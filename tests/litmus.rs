#![deny(warnings, rust_2018_idioms)]

use weft::intercept::{on_shared_read, on_shared_write};
use weft::rt::memory::{ClassDescriptor, MemoryLocation};
use weft::{code_location, Builder, Scenario};

use std::collections::HashSet;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::{Arc, Mutex};

type Slots = Arc<Mutex<(i32, i32)>>;

/// Two unsynchronized increments must admit the lost update: both threads
/// read 0, the final value is 1.
#[test]
fn counter_lost_update() {
    let x = MemoryLocation::static_field("Counter", "value");
    let slots: Slots = Arc::new(Mutex::new((0, 0)));
    let observed = Arc::new(Mutex::new(HashSet::new()));

    let inc = |slot: usize| {
        let x = x.clone();
        let slots = slots.clone();
        move || {
            let v = on_shared_read(&x, Relaxed, code_location!())
                .as_i32()
                .unwrap();

            let mut slots = slots.lock().unwrap();
            if slot == 0 {
                slots.0 = v;
            } else {
                slots.1 = v;
            }
            drop(slots);

            on_shared_write(&x, (v + 1).into(), Relaxed, code_location!());
        }
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Counter").field_i32("value"))
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

    assert!(report.explorations > 1);
    assert!(
        observed.contains(&(0, 0)),
        "lost update not discovered: {:?}",
        *observed
    );
}

#[test]
fn store_buffering() {
    let x = MemoryLocation::static_field("Litmus", "x");
    let y = MemoryLocation::static_field("Litmus", "y");
    let slots: Slots = Arc::new(Mutex::new((0, 0)));
    let observed = Arc::new(Mutex::new(HashSet::new()));

    let side = |write: MemoryLocation, read: MemoryLocation, slot: usize| {
        let slots = slots.clone();
        move || {
            on_shared_write(&write, 1.into(), Relaxed, code_location!());
            let v = on_shared_read(&read, Relaxed, code_location!())
                .as_i32()
                .unwrap();

            let mut slots = slots.lock().unwrap();
            if slot == 0 {
                slots.0 = v;
            } else {
                slots.1 = v;
            }
        }
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Litmus").field_i32("x").field_i32("y"))
        .spawn("left", side(x.clone(), y.clone(), 0))
        .spawn("right", side(y, x, 1))
        .invariant({
            let slots = slots.clone();
            let observed = observed.clone();
            move || {
                observed.lock().unwrap().insert(*slots.lock().unwrap());
                true
            }
        });

    Builder::new().check(&scenario).unwrap();
    let observed = observed.lock().unwrap();

    assert!(
        observed.contains(&(0, 0)),
        "store buffering outcome not discovered: {:?}",
        *observed
    );
}

/// Exclusive increments never lose an update: read-from choices that would
/// let both rmws consume the same write are discarded as atomicity
/// violations.
#[test]
fn exclusive_increments() {
    let x = MemoryLocation::static_field("Counter", "value");
    let slots: Slots = Arc::new(Mutex::new((0, 0)));
    let observed = Arc::new(Mutex::new(HashSet::new()));

    let inc = |slot: usize| {
        let x = x.clone();
        let slots = slots.clone();
        move || {
            let old = weft::intercept::on_read_modify_write(
                &x,
                |v| (v.as_i32().unwrap() + 1).into(),
                Relaxed,
                code_location!(),
            )
            .as_i32()
            .unwrap();

            let mut slots = slots.lock().unwrap();
            if slot == 0 {
                slots.0 = old;
            } else {
                slots.1 = old;
            }
        }
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Counter").field_i32("value"))
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

    assert!(report.pruned > 0, "the lost-update schedule must be discarded");
    assert!(
        !observed.contains(&(0, 0)),
        "exclusive increments lost an update: {:?}",
        *observed
    );
}

fn publication(
    write_order: std::sync::atomic::Ordering,
    read_order: std::sync::atomic::Ordering,
) -> HashSet<i32> {
    let data = MemoryLocation::static_field("Pub", "data");
    let flag = MemoryLocation::static_field("Pub", "flag");
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let writer = {
        let data = data.clone();
        let flag = flag.clone();
        move || {
            on_shared_write(&data, 42.into(), Relaxed, code_location!());
            on_shared_write(&flag, true.into(), write_order, code_location!());
        }
    };

    let reader = {
        let data = data.clone();
        let flag = flag.clone();
        let seen = seen.clone();
        move || {
            loop {
                let ready = on_shared_read(&flag, read_order, code_location!())
                    .as_bool()
                    .unwrap();
                if ready {
                    break;
                }
            }

            let v = on_shared_read(&data, Relaxed, code_location!())
                .as_i32()
                .unwrap();
            seen.lock().unwrap().insert(v);
        }
    };

    let scenario = Scenario::new()
        .class(
            ClassDescriptor::new("Pub")
                .field_i32("data")
                .field_bool("flag"),
        )
        .spawn("writer", writer)
        .spawn("reader", reader);

    Builder::new().check(&scenario).unwrap();

    let seen = seen.lock().unwrap().clone();
    seen
}

/// With plain accesses an execution exists where the reader observes the
/// flag but stale data.
#[test]
fn publication_relaxed() {
    let seen = publication(Relaxed, Relaxed);
    assert!(seen.contains(&42), "seen = {:?}", seen);
    assert!(
        seen.contains(&0),
        "relaxed publication never produced the stale read: {:?}",
        seen
    );
}

/// Release/acquire publication forbids the stale read.
#[test]
fn publication_release_acquire() {
    let seen = publication(Release, Acquire);
    assert!(seen.contains(&42), "seen = {:?}", seen);
    assert!(
        !seen.contains(&0),
        "release/acquire publication leaked a stale read: {:?}",
        seen
    );
}
