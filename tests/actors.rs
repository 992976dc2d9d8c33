#![deny(warnings, rust_2018_idioms)]

use weft::intercept::{
    on_allocation, on_array_allocation, on_coroutine_suspend, on_random, on_shared_read,
    on_shared_write,
};
use weft::rt::memory::{ClassDescriptor, MemoryLocation};
use weft::rt::Value;
use weft::{code_location, Builder, Scenario};

use std::collections::HashSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

/// Objects allocated in one schedule rebind to the same identity when the
/// schedule is replayed; field traffic round-trips through the engine.
#[test]
fn allocation_and_field_traffic() {
    let x = MemoryLocation::static_field("Alloc", "x");

    let allocator = {
        let x = x.clone();
        move || {
            let node = on_allocation("com.example.Node");
            let id = weft::intercept::object_id(&node);

            let field = MemoryLocation::object_field(id, "com.example.Node", "value");
            on_shared_write(&field, 5.into(), Relaxed, code_location!());
            let v = on_shared_read(&field, Relaxed, code_location!())
                .as_i32()
                .unwrap();
            assert_eq!(v, 5);

            on_shared_write(&x, 1.into(), Relaxed, code_location!());
        }
    };

    let reader = {
        let x = x.clone();
        move || {
            let _ = on_shared_read(&x, Relaxed, code_location!());
        }
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Alloc").field_i32("x"))
        .class(ClassDescriptor::new("com.example.Node").field_i32("value"))
        .spawn("allocator", allocator)
        .spawn("reader", reader);

    let report = Builder::new().check(&scenario).unwrap();
    assert!(report.explorations > 1, "read alternatives force replays");
}

/// Array cells go through the same allocation protocol.
#[test]
fn array_allocation() {
    let scenario = Scenario::new().spawn("alloc", || {
        let array = on_array_allocation("int[]", 4, Value::from(0i32));
        assert!(array.as_object().is_some());
    });

    Builder::new().check(&scenario).unwrap();
}

/// Random values are replay-stable: every exploration of the same prefix
/// observes the same value.
#[test]
fn random_is_replay_stable() {
    let x = MemoryLocation::static_field("Rng", "x");
    let values = Arc::new(Mutex::new(HashSet::new()));

    let roller = {
        let values = values.clone();
        let x = x.clone();
        move || {
            let v = on_random();
            values.lock().unwrap().insert(v);
            // Unrelated contention, to force several explorations.
            let _ = on_shared_read(&x, Relaxed, code_location!());
        }
    };

    let writer = {
        let x = x.clone();
        move || on_shared_write(&x, 1.into(), Relaxed, code_location!())
    };

    let scenario = Scenario::new()
        .class(ClassDescriptor::new("Rng").field_i32("x"))
        .spawn("roller", roller)
        .spawn("writer", writer);

    let report = Builder::new().check(&scenario).unwrap();
    let values = values.lock().unwrap();

    assert!(report.explorations > 1);
    assert_eq!(values.len(), 1, "random diverged across replays: {:?}", *values);
}

/// A promptly-cancellable suspension with no resumer synchronizes against
/// the root and reports cancellation.
#[test]
fn prompt_cancellation() {
    let cancelled = Arc::new(Mutex::new(None));

    let scenario = Scenario::new().spawn("suspender", {
        let cancelled = cancelled.clone();
        move || {
            let outcome = on_coroutine_suspend(true);
            *cancelled.lock().unwrap() = Some(outcome);
        }
    });

    Builder::new().check(&scenario).unwrap();
    assert_eq!(*cancelled.lock().unwrap(), Some(true));
}
