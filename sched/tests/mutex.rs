//! Mutex behavior under real contention.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use unios_sched::{kernel, yield_now, Attr, Config, Mutex, RawMutex, Thread};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    kernel::init(Config::new().cpus(4));
}

#[test]
fn counter_is_exact_under_contention() {
    setup();
    let counter = Arc::new(Mutex::new(0u64));
    let threads: Vec<_> = (0..8)
        .map(|i| {
            let counter = counter.clone();
            Thread::spawn(
                move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                },
                Attr::new().name(format!("inc-{i}")),
            )
        })
        .collect();
    for t in threads {
        t.join();
    }
    assert_eq!(*counter.lock(), 8000);
}

#[test]
fn critical_sections_do_not_interleave() {
    setup();
    // Two fields updated non-atomically inside the lock; any interleaving
    // shows up as a != b.
    let pair = Arc::new(Mutex::new((0u64, 0u64)));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let pair = pair.clone();
            Thread::spawn(
                move || {
                    for i in 0..500 {
                        let mut g = pair.lock();
                        let a = g.0;
                        if i % 16 == 0 {
                            yield_now(); // widen the window while holding the lock
                        }
                        g.0 = a + 1;
                        g.1 += 1;
                        assert_eq!(g.0, g.1);
                    }
                },
                Attr::new(),
            )
        })
        .collect();
    for t in threads {
        t.join();
    }
    let g = pair.lock();
    assert_eq!(*g, (2000, 2000));
}

#[test]
fn recursion_requires_matching_unlocks() {
    setup();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    Thread::spawn(
        move || {
            let m = RawMutex::new();
            m.lock();
            m.lock();
            assert!(m.held_by_current());
            m.unlock();
            assert!(m.held_by_current());
            m.unlock();
            assert!(!m.held_by_current());
            done2.store(true, Ordering::Release);
        },
        Attr::new(),
    )
    .join();
    assert!(done.load(Ordering::Acquire));
}

#[test]
fn try_lock_fails_while_held_elsewhere() {
    setup();
    let m = Arc::new(Mutex::new(()));
    let holding = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let (m2, holding2, release2) = (m.clone(), holding.clone(), release.clone());
    let t = Thread::spawn(
        move || {
            let _g = m2.lock();
            holding2.store(true, Ordering::Release);
            unios_sched::wait_until(|| release2.load(Ordering::Acquire));
        },
        Attr::new().name("holder"),
    );

    while !holding.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(m.try_lock().is_none());

    release.store(true, Ordering::Release);
    t.wake();
    t.join();
    assert!(m.try_lock().is_some());
}

#[test]
fn wait_until_releases_the_mutex_while_asleep() {
    setup();
    struct Shared {
        mtx: RawMutex,
        value: AtomicUsize,
    }
    let s = Arc::new(Shared {
        mtx: RawMutex::new(),
        value: AtomicUsize::new(0),
    });

    let s2 = s.clone();
    let consumer = Thread::spawn(
        move || {
            s2.mtx.lock();
            s2.mtx.wait_until(|| s2.value.load(Ordering::Acquire) != 0);
            assert_eq!(s2.value.load(Ordering::Acquire), 7);
            s2.mtx.unlock();
        },
        Attr::new().name("consumer"),
    );

    std::thread::sleep(Duration::from_millis(20));
    // The producer can take the mutex: the sleeping consumer released it.
    s.mtx.lock();
    s.value.store(7, Ordering::Release);
    s.mtx.unlock();
    consumer.wake();
    consumer.join();
}

#[test]
fn handoff_stress() {
    setup();
    let counter = Arc::new(Mutex::new(0u64));
    let threads: Vec<_> = (0..10)
        .map(|i| {
            let counter = counter.clone();
            Thread::spawn(
                move || {
                    for n in 0..1000u64 {
                        {
                            let mut g = counter.lock();
                            *g += 1;
                        }
                        if n % 64 == 0 {
                            yield_now();
                        }
                    }
                },
                Attr::new().name(format!("stress-{i}")),
            )
        })
        .collect();
    for t in threads {
        t.join();
    }
    assert_eq!(*counter.lock(), 10_000);
}
