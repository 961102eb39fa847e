mod common;

use common::{entries, log, note, within};
use spindle_kernel::{KernelConfig, Semaphore};
use std::sync::Arc;

#[test]
fn test_waiters_wake_in_arrival_order() {
    let order = log();
    let shared = Arc::clone(&order);

    let leftover = within(KernelConfig::default(), move |k| {
        let sem = Arc::new(Semaphore::new(0));
        for i in 0..3 {
            let sem = Arc::clone(&sem);
            let log = Arc::clone(&shared);
            k.fork(move |k| {
                sem.p(k);
                note(&log, format!("w{}", i));
            })
            .unwrap();
        }

        // Let every waiter queue up.
        k.yield_now();
        assert_eq!(sem.waiters(), 3);

        for _ in 0..3 {
            sem.v(k);
        }
        k.yield_now();
        (sem.count(), sem.waiters())
    });

    assert_eq!(entries(&order), ["w0", "w1", "w2"]);
    assert_eq!(leftover, (0, 0));
}

#[test]
fn test_initial_count_admits_without_blocking() {
    let (taken, count) = within(KernelConfig::default(), |k| {
        let sem = Semaphore::new(2);
        sem.p(k);
        let second = sem.try_p();
        let third = sem.try_p();
        sem.v(k);
        ((second, third), sem.count())
    });
    assert_eq!(taken, (true, false));
    assert_eq!(count, 1);
}

#[test]
fn test_mutual_exclusion_across_yields() {
    let events = log();
    let shared = Arc::clone(&events);

    within(KernelConfig::default(), move |k| {
        let lock = Arc::new(Semaphore::new(1));
        let done = Arc::new(Semaphore::new(0));
        for name in ["a", "b"] {
            let (lock, done, log) = (Arc::clone(&lock), Arc::clone(&done), Arc::clone(&shared));
            k.fork(move |k| {
                lock.p(k);
                note(&log, format!("{} in", name));
                k.yield_now();
                note(&log, format!("{} out", name));
                lock.v(k);
                done.v(k);
            })
            .unwrap();
        }
        done.p(k);
        done.p(k);
    });

    assert_eq!(entries(&events), ["a in", "a out", "b in", "b out"]);
}
