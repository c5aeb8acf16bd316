#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use common::wait_until;
use flightgroup::{CallError, Group, GroupConfig, PanicPolicy};

#[test]
fn lone_caller_is_not_shared() {
    let group: Group<&str, u64, &str> = Group::new();
    let outcome = group.call("k", || Ok(7));
    assert_eq!(outcome.result, Ok(7));
    assert!(!outcome.shared, "nobody else asked for the value");
    assert_eq!(group.in_flight(), 0);
}

#[test]
fn concurrent_callers_share_one_execution() {
    const CALLERS: u64 = 16;

    let group: Group<String, u64, &str> = Group::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let group = group.clone();
            let runs = Arc::clone(&runs);
            thread::spawn(move || {
                let observer = group.clone();
                group.call("shared-key".to_owned(), move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    // Hold the flight open until every other caller has attached.
                    wait_until("all joiners", || observer.stats().joins == CALLERS - 1);
                    Ok(99)
                })
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(runs.load(Ordering::SeqCst), 1, "work must run exactly once");
    assert!(outcomes.iter().all(|o| o.result == Ok(99)));
    assert!(
        outcomes.iter().all(|o| o.shared),
        "every caller, leader included, overlapped with another"
    );
    assert_eq!(group.stats().executions, 1);
    assert_eq!(group.in_flight(), 0);
}

#[test]
fn slow_increment_runs_once_for_overlapping_callers() {
    let group: Group<&str, u64, &str> = Group::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let slow_increment = {
        let counter = Arc::clone(&counter);
        move || {
            thread::sleep(Duration::from_millis(50));
            Ok(counter.fetch_add(1, Ordering::SeqCst) as u64 + 1)
        }
    };

    let first = {
        let group = group.clone();
        let work = slow_increment.clone();
        thread::spawn(move || group.call("build:target-A", work))
    };
    wait_until("first caller in flight", || {
        group.is_in_flight(&"build:target-A")
    });
    let second = group.call("build:target-A", slow_increment);
    let first = first.join().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(first.result, Ok(1));
    assert_eq!(second.result, Ok(1));
    assert!(second.shared, "the second caller joined an in-flight call");
}

#[test]
fn errors_reach_every_waiter_unaltered() {
    let group: Group<&str, u64, &str> = Group::new();

    let joiner = {
        let group = group.clone();
        thread::spawn(move || {
            wait_until("leader in flight", || group.is_in_flight(&"k"));
            group.call("k", || Ok(0))
        })
    };

    let observer = group.clone();
    let leader = group.call("k", move || {
        wait_until("joiner attached", || observer.stats().joins == 1);
        Err("disk full")
    });
    let joiner = joiner.join().unwrap();

    assert_eq!(leader.result, Err(CallError::Work("disk full")));
    assert_eq!(joiner.result, Err(CallError::Work("disk full")));
    assert!(leader.shared);
    assert!(joiner.shared);
}

#[test]
fn completed_key_runs_again() {
    let group: Group<&str, usize, &str> = Group::new();
    let runs = Arc::new(AtomicUsize::new(0));

    for expected in 1..=3 {
        let runs = Arc::clone(&runs);
        let outcome = group.call("k", move || Ok(runs.fetch_add(1, Ordering::SeqCst) + 1));
        assert_eq!(outcome.result, Ok(expected));
        assert!(!group.is_in_flight(&"k"), "entry must be gone after completion");
    }

    let failed = group.call("k", || Err("nope"));
    assert!(failed.result.is_err());
    assert_eq!(group.in_flight(), 0, "errors clean up too");
}

#[test]
fn forget_starts_an_independent_execution() {
    let group: Group<&str, &str, &str> = Group::new();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let first = {
        let group = group.clone();
        thread::spawn(move || {
            group.call("k", move || {
                release_rx.recv().unwrap();
                Ok("first")
            })
        })
    };
    wait_until("first call in flight", || group.is_in_flight(&"k"));

    // Attached before forget: must still see the first execution's result.
    let early = group.call_detached("k", || Ok("never runs"));
    assert!(!early.is_leader());

    assert!(group.forget(&"k"));
    assert!(!group.forget(&"k"), "nothing left to forget");

    let second = group.call("k", || Ok("second"));
    assert_eq!(second.result, Ok("second"));
    assert!(!second.shared);

    release_tx.send(()).unwrap();
    let first = first.join().unwrap();
    assert_eq!(first.result, Ok("first"));
    assert_eq!(early.wait().result, Ok("first"));
    assert_eq!(group.stats().forgets, 1);
    assert_eq!(group.in_flight(), 0);
}

#[test]
fn finishing_forgotten_call_keeps_newer_entry() {
    let group: Group<&str, &str, &str> = Group::new();
    let (old_tx, old_rx) = mpsc::channel::<()>();
    let (new_tx, new_rx) = mpsc::channel::<()>();

    let old = group.call_detached("k", move || {
        old_rx.recv().unwrap();
        Ok("old")
    });
    wait_until("old in flight", || group.is_in_flight(&"k"));
    group.forget(&"k");

    let new = group.call_detached("k", move || {
        new_rx.recv().unwrap();
        Ok("new")
    });
    assert!(new.is_leader());

    old_tx.send(()).unwrap();
    assert_eq!(old.wait().result, Ok("old"));
    assert!(
        group.is_in_flight(&"k"),
        "the old execution must not evict the new one"
    );

    let joiner = group.call_detached("k", || Ok("unused"));
    assert!(!joiner.is_leader());

    new_tx.send(()).unwrap();
    assert_eq!(joiner.wait().result, Ok("new"));
    assert!(new.wait().shared);
}

#[test]
fn panic_is_delivered_to_every_waiter() {
    let group: Group<&str, u64, &str> = Group::new();

    let joiner = {
        let group = group.clone();
        thread::spawn(move || {
            wait_until("leader in flight", || group.is_in_flight(&"k"));
            group.call("k", || Ok(1))
        })
    };

    let observer = group.clone();
    let leader = group.call("k", move || {
        wait_until("joiner attached", || observer.stats().joins == 1);
        panic!("exploded")
    });
    let joiner = joiner.join().unwrap();

    assert!(matches!(leader.result, Err(CallError::Panicked(ref m)) if &**m == "exploded"));
    assert_eq!(joiner.result, leader.result);
    assert!(!group.is_in_flight(&"k"));
    assert_eq!(group.stats().panics, 1);

    // The key is not bricked.
    assert_eq!(group.call("k", || Ok(5)).result, Ok(5));
}

#[test]
fn resume_policy_reraises_in_leader_only() {
    let config = GroupConfig {
        panic_policy: PanicPolicy::Resume,
        ..GroupConfig::default()
    };
    let group: Group<&str, u64, &str> = Group::with_config(config);

    let joiner = {
        let group = group.clone();
        thread::spawn(move || {
            wait_until("leader in flight", || group.is_in_flight(&"k"));
            group.call("k", || Ok(1))
        })
    };

    let observer = group.clone();
    let leader = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        group.call("k", move || {
            wait_until("joiner attached", || observer.stats().joins == 1);
            panic!("resumed")
        })
    }));

    let payload = leader.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"resumed"));

    let joiner = joiner.join().unwrap();
    assert!(matches!(joiner.result, Err(CallError::Panicked(_))));
    assert_eq!(group.in_flight(), 0);
}

#[test]
fn detached_call_returns_immediately() {
    let group: Group<&str, u64, &str> = Group::new();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let leader = group.call_detached("k", move || {
        release_rx.recv().unwrap();
        Ok(11)
    });
    assert!(leader.is_leader());

    let joiner = group.call_detached("k", || Ok(0));
    assert!(!joiner.is_leader());

    assert!(joiner.try_outcome().is_none());
    assert!(
        joiner.wait_timeout(Duration::from_millis(20)).is_none(),
        "giving up locally must not need the result"
    );

    release_tx.send(()).unwrap();
    let leader = leader.wait();
    let joiner = joiner.wait();
    assert_eq!(leader.result, Ok(11));
    assert_eq!(joiner.result, Ok(11));
    assert!(leader.shared);
    assert!(joiner.shared);
    assert_eq!(group.stats().executions, 1);
}

#[test]
fn forget_unshared_keeps_entries_with_joiners() {
    let group: Group<&str, u64, &str> = Group::new();
    assert!(group.forget_unshared(&"absent"));

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let leader = group.call_detached("k", move || {
        release_rx.recv().unwrap();
        Ok(1)
    });
    wait_until("in flight", || group.is_in_flight(&"k"));
    let joiner = group.call_detached("k", || Ok(0));

    assert!(!group.forget_unshared(&"k"), "a joiner is attached");
    assert!(group.is_in_flight(&"k"));

    release_tx.send(()).unwrap();
    assert_eq!(joiner.wait().result, Ok(1));
    assert_eq!(leader.wait().result, Ok(1));

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let lone = group.call_detached("k", move || {
        release_rx.recv().unwrap();
        Ok(2)
    });
    assert!(group.forget_unshared(&"k"));
    assert!(!group.is_in_flight(&"k"));
    release_tx.send(()).unwrap();
    assert_eq!(lone.wait().result, Ok(2));
}

#[test]
fn work_may_call_back_with_another_key() {
    let group: Group<&str, u64, &str> = Group::new();
    let inner = group.clone();
    let outcome = group.call("outer", move || {
        let nested = inner.call("inner", || Ok(20));
        nested.result.map(|v| v + 1).map_err(|_| "inner failed")
    });
    assert_eq!(outcome.result, Ok(21));
    assert_eq!(group.stats().executions, 2);
}
