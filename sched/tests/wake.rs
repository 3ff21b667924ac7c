//! Wake/exit races and interruptible waits.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use unios_sched::sched::thread::Status;
use unios_sched::{kernel, Attr, Config, Thread};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    kernel::init(Config::new().cpus(4));
}

#[test]
fn wake_with_survives_racing_exit() {
    setup();
    // The hazard: the waiter sees the flag, returns, terminates and is
    // dropped while the waker is still inside wake(). wake_with holds a
    // strong handle across the action + wake pair, so 10k iterations of
    // the race must never touch freed state.
    for _ in 0..10_000 {
        let flag = Arc::new(AtomicBool::new(false));
        let f2 = flag.clone();
        let t = Thread::spawn(
            move || unios_sched::wait_until(|| f2.load(Ordering::Acquire)),
            Attr::new().name("racer"),
        );
        t.wake_with(|| flag.store(true, Ordering::Release));
        t.join();
    }
}

#[test]
fn wake_on_a_runnable_thread_is_a_noop() {
    setup();
    let stop = Arc::new(AtomicBool::new(false));
    let s2 = stop.clone();
    let t = Thread::spawn(
        move || {
            while !s2.load(Ordering::Acquire) {
                unios_sched::preempt_point();
            }
        },
        Attr::new().name("busy"),
    );
    // Never in Waiting state, so wake() reports it had nothing to do.
    assert!(!t.wake());
    stop.store(true, Ordering::Release);
    t.join();
}

#[test]
fn interrupt_aborts_wait_until_interruptible() {
    setup();
    let outcome = Arc::new(AtomicU8::new(0));
    let o2 = outcome.clone();
    let t = Thread::spawn(
        move || {
            let r = unios_sched::wait_until_interruptible(|| false);
            o2.store(if r.is_err() { 2 } else { 1 }, Ordering::Release);
        },
        Attr::new().name("interruptible"),
    );
    t.interrupt();
    t.join();
    assert_eq!(outcome.load(Ordering::Acquire), 2);
    assert!(!t.is_interrupted(), "flag must be consumed by the failed wait");
}

#[test]
fn interrupt_does_not_abort_plain_waits() {
    setup();
    let flag = Arc::new(AtomicBool::new(false));
    let f2 = flag.clone();
    let t = Thread::spawn(
        move || unios_sched::wait_until(|| f2.load(Ordering::Acquire)),
        Attr::new().name("stoic"),
    );
    std::thread::sleep(Duration::from_millis(10));
    t.interrupt(); // wakes the thread, but the predicate is still false
    // It must settle back into its wait rather than return.
    let t0 = Instant::now();
    while t.status() != Status::Waiting {
        assert!(t0.elapsed() < Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(1));
    }
    t.wake_with(|| flag.store(true, Ordering::Release));
    t.join();
}

#[test]
fn wake_racing_the_sleep_window_cannot_wedge_a_cpu() {
    setup();
    // Hammer the window between a thread announcing its sleep and
    // dispatching away. A waker that catches the thread there must
    // cancel the sleep on its home CPU, never queue it on another CPU
    // while the home CPU still counts it as current.
    let seq = Arc::new(AtomicUsize::new(0));
    let s2 = seq.clone();
    let t = Thread::spawn(
        move || {
            let mut seen = 0usize;
            while seen < 2_000 {
                unios_sched::wait_until(|| s2.load(Ordering::Acquire) > seen);
                seen = s2.load(Ordering::Acquire);
            }
        },
        Attr::new().name("migrant"),
    );
    while t.status() != Status::Terminated {
        seq.fetch_add(1, Ordering::Release);
        t.wake();
    }
    t.join();

    // Every CPU must still dispatch fresh work.
    let canaries: Vec<_> = (0..4)
        .map(|cpu| {
            Thread::spawn(
                || {},
                Attr::new().name(format!("canary-{cpu}")).pin(cpu),
            )
        })
        .collect();
    let t0 = Instant::now();
    for c in &canaries {
        while c.status() != Status::Terminated {
            assert!(t0.elapsed() < Duration::from_secs(5), "cpu wedged");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    for c in canaries {
        c.join();
    }
}
