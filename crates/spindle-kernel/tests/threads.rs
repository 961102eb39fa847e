mod common;

use common::{entries, log, note, within};
use spindle_kernel::{Kernel, KernelConfig, KernelError, Semaphore, ThreadId, ThreadState};
use std::sync::{mpsc, Arc, Mutex};

#[test]
fn test_forked_threads_interleave_in_fifo_order() {
    let order = log();
    let shared = Arc::clone(&order);

    within(KernelConfig::default(), move |k| {
        for name in ["a", "b"] {
            let log = Arc::clone(&shared);
            k.fork(move |k| {
                for i in 0..3 {
                    note(&log, format!("{}{}", name, i));
                    k.yield_now();
                }
            })
            .unwrap();
        }
    });

    assert_eq!(entries(&order), ["a0", "b0", "a1", "b1", "a2", "b2"]);
}

#[test]
fn test_cleanup_frees_exited_threads() {
    let (freed, live) = within(KernelConfig::default(), |k| {
        for _ in 0..3 {
            k.fork(|_| {}).unwrap();
        }
        assert_eq!(k.live_threads(), 5);
        k.yield_now();
        (k.cleanup(), k.live_threads())
    });

    assert_eq!(freed, 3);
    assert_eq!(live, 2);
}

#[test]
fn test_thread_limit_rejects_creation() {
    let config = KernelConfig {
        max_threads: Some(2),
        ..KernelConfig::default()
    };

    let result = within(config, |k| k.fork(|_| {}));
    assert!(matches!(result, Err(KernelError::Allocation(_))));
}

#[test]
fn test_stopped_thread_resumes_after_start() {
    let events = log();
    let shared = Arc::clone(&events);

    let (blocked_state, finished_state) = within(KernelConfig::default(), move |k| {
        let log = Arc::clone(&shared);
        let worker = k
            .fork(move |k| {
                note(&log, "stopping");
                k.stop();
                note(&log, "resumed");
            })
            .unwrap();

        k.yield_now();
        let blocked = k.state_of(worker);
        note(&shared, "starting");
        k.start(worker);
        k.yield_now();
        (blocked, k.state_of(worker))
    });

    assert_eq!(blocked_state, Some(ThreadState::Blocked));
    assert_eq!(finished_state, Some(ThreadState::Exited));
    assert_eq!(entries(&events), ["stopping", "starting", "resumed"]);
}

#[test]
fn test_start_of_running_thread_is_ignored() {
    let ready = within(KernelConfig::default(), |k| {
        k.start(k.current());
        k.start(ThreadId::new(999));
        k.ready_threads()
    });
    // Only the idle thread waits.
    assert_eq!(ready, 1);
}

#[test]
fn test_current_thread_ids() {
    let (main, child) = within(KernelConfig::default(), |k| {
        let (tx, rx) = mpsc::channel();
        k.fork(move |k| tx.send(k.current_id()).unwrap()).unwrap();
        k.yield_now();
        (k.current_id(), rx.recv().unwrap())
    });
    assert_eq!(main, 1);
    assert_eq!(child, 2);
}

#[test]
fn test_panicking_thread_counts_as_exited() {
    let after = within(KernelConfig::default(), |k| {
        let victim = k.fork(|_| panic!("thread body failed")).unwrap();
        k.yield_now();
        k.state_of(victim)
    });
    assert_eq!(after, Some(ThreadState::Exited));
}

#[test]
fn test_second_boot_is_rejected() {
    common::init_logging();
    let kernel = Kernel::new(KernelConfig::default());
    kernel.run(|_| {}).unwrap();
    assert!(matches!(
        kernel.run(|_| {}),
        Err(KernelError::AlreadyBooted)
    ));
}

#[test]
fn test_run_reports_deadlock() {
    common::init_logging();
    let kernel = Kernel::new(KernelConfig::default());
    let reached = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&reached);

    let result = kernel.run(move |k| {
        let never = Semaphore::new(0);
        *flag.lock().unwrap() = true;
        never.p(k);
    });

    assert!(*reached.lock().unwrap());
    assert!(matches!(
        result,
        Err(KernelError::Deadlock {
            blocked: 1,
            unstarted: 0
        })
    ));
}

#[test]
fn test_deadlock_counts_unstarted_threads() {
    common::init_logging();
    let kernel = Kernel::new(KernelConfig::default());

    let result = kernel.run(|k| {
        k.create(|_| {}).unwrap();
    });

    assert!(matches!(
        result,
        Err(KernelError::Deadlock {
            blocked: 0,
            unstarted: 1
        })
    ));
}
