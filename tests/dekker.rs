#![deny(warnings, rust_2018_idioms)]

use weft::intercept::{on_shared_read, on_shared_write};
use weft::rt::memory::{ClassDescriptor, MemoryLocation};
use weft::rt::Failure;
use weft::{code_location, Builder, Scenario};

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::Arc;

/// Dekker-style mutual exclusion over plain flags and a turn variable:
///
/// ```text
/// flag[i] = true;
/// turn = 1 - i;
/// while flag[1 - i] && turn == 1 - i {}
/// // critical section
/// flag[i] = false;
/// ```
///
/// Correct under sequential consistency, broken under relaxed memory: the
/// engine finds an execution where each thread observes the other's flag
/// still down and both enter the critical section. Occupancy is witnessed
/// through a shared `owner` slot written and read back inside the section;
/// reading back the other thread's id means the exclusion claim failed.
#[test]
fn dekker_mutex_breaks_under_relaxed_memory() {
    let flags = [
        MemoryLocation::static_field("Dekker", "flag0"),
        MemoryLocation::static_field("Dekker", "flag1"),
    ];
    let turn = MemoryLocation::static_field("Dekker", "turn");
    let owner = MemoryLocation::static_field("Dekker", "owner");
    let violated = Arc::new(AtomicBool::new(false));

    let side = |i: usize| {
        let mine = flags[i].clone();
        let theirs = flags[1 - i].clone();
        let turn = turn.clone();
        let owner = owner.clone();
        let violated = violated.clone();
        move || {
            let me = i as i32;
            let other = 1 - me;

            on_shared_write(&mine, true.into(), Relaxed, code_location!());
            on_shared_write(&turn, other.into(), Relaxed, code_location!());

            loop {
                let contended = on_shared_read(&theirs, Relaxed, code_location!())
                    .as_bool()
                    .unwrap();
                if !contended {
                    break;
                }

                let t = on_shared_read(&turn, Relaxed, code_location!())
                    .as_i32()
                    .unwrap();
                if t != other {
                    break;
                }
            }

            // Critical section.
            on_shared_write(&owner, me.into(), Relaxed, code_location!());
            let seen = on_shared_read(&owner, Relaxed, code_location!())
                .as_i32()
                .unwrap();
            if seen != me {
                violated.store(true, SeqCst);
            }

            on_shared_write(&mine, false.into(), Relaxed, code_location!());
        }
    };

    let scenario = Scenario::new()
        .class(
            ClassDescriptor::new("Dekker")
                .field_bool("flag0")
                .field_bool("flag1")
                .field_i32("turn")
                .field_i32("owner"),
        )
        .spawn("left", side(0))
        .spawn("right", side(1))
        .invariant({
            let violated = violated.clone();
            // Claimed mutual exclusion.
            move || !violated.load(SeqCst)
        });

    match Builder::new().check(&scenario) {
        Err(Failure::IncorrectResult) => {}
        other => panic!(
            "expected the mutual-exclusion claim to fail, got {:?}",
            other
        ),
    }
}
