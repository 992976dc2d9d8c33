#![deny(warnings, rust_2018_idioms)]

use weft::intercept::{on_park, on_unpark};
use weft::rt::Failure;
use weft::{Builder, Scenario};

/// One park, one unpark: the park response synchronizes with the unpark
/// token and the final join completes in every execution.
#[test]
fn park_unpark_ping_pong() {
    let scenario = Scenario::new()
        .spawn("parker", || on_park())
        .spawn("unparker", || on_unpark(0));

    let report = Builder::new().check(&scenario).unwrap();
    assert!(report.explorations >= 1);
    assert!(report.failures.is_empty());
}

/// The token is posted before the park in some explorations; the park must
/// consume it instead of blocking forever.
#[test]
fn unpark_before_park() {
    let scenario = Scenario::new()
        .spawn("unparker", || on_unpark(1))
        .spawn("parker", || on_park());

    Builder::new().check(&scenario).unwrap();
}

#[test]
fn park_without_unpark_deadlocks() {
    let scenario = Scenario::new().spawn("parker", || on_park());

    match Builder::new().check(&scenario) {
        Err(Failure::Deadlock { threads }) => assert_eq!(threads, vec![0]),
        other => panic!("expected a deadlock, got {:?}", other),
    }
}
