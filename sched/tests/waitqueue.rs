//! Wait queue FIFO order, wait morphing, and condvars.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex as SpinMutex;
use unios_sched::sched::thread::Status;
use unios_sched::{kernel, Attr, Condvar, Config, RawMutex, Thread, WaitQueue};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    kernel::init(Config::new().cpus(4));
}

struct Queue {
    mtx: RawMutex,
    wq: WaitQueue,
    arrivals: SpinMutex<Vec<usize>>,
    woken: SpinMutex<Vec<usize>>,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mtx: RawMutex::new(),
            wq: WaitQueue::new(),
            arrivals: SpinMutex::new(Vec::new()),
            woken: SpinMutex::new(Vec::new()),
        })
    }
}

fn park_waiters(q: &Arc<Queue>, n: usize) -> Vec<Arc<Thread>> {
    (0..n)
        .map(|i| {
            let q = q.clone();
            Thread::spawn(
                move || {
                    q.mtx.lock();
                    // Arrival and queue insertion happen under one lock
                    // hold, so the two orders must match exactly.
                    q.arrivals.lock().push(i);
                    q.wq.wait(&q.mtx);
                    q.woken.lock().push(i);
                    q.mtx.unlock();
                },
                Attr::new().name(format!("sleeper-{i}")),
            )
        })
        .collect()
}

fn all_arrived(q: &Arc<Queue>, n: usize) {
    let t0 = Instant::now();
    loop {
        q.mtx.lock();
        let arrived = q.arrivals.lock().len();
        q.mtx.unlock();
        if arrived == n {
            return;
        }
        assert!(t0.elapsed() < Duration::from_secs(5), "sleepers never queued");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn wake_one_is_fifo() {
    setup();
    const N: usize = 6;
    let q = Queue::new();
    let threads = park_waiters(&q, N);
    all_arrived(&q, N);

    for _ in 0..N {
        q.mtx.lock();
        q.wq.wake_one(&q.mtx);
        q.mtx.unlock();
    }
    for t in threads {
        t.join();
    }
    let arrivals = q.arrivals.lock().clone();
    let woken = q.woken.lock().clone();
    assert_eq!(woken, arrivals, "wake order must match arrival order");
}

#[test]
fn wake_all_serializes_in_fifo_order() {
    setup();
    const N: usize = 5;
    let q = Queue::new();
    let threads = park_waiters(&q, N);
    all_arrived(&q, N);

    q.mtx.lock();
    q.wq.wake_all(&q.mtx);
    q.mtx.unlock();
    for t in threads {
        t.join();
    }
    let arrivals = q.arrivals.lock().clone();
    let woken = q.woken.lock().clone();
    assert_eq!(woken, arrivals);
}

#[test]
fn wake_some_rouses_only_the_oldest_n() {
    setup();
    const N: usize = 5;
    let q = Queue::new();
    let threads = park_waiters(&q, N);
    all_arrived(&q, N);

    q.mtx.lock();
    q.wq.wake_some(&q.mtx, 2);
    q.mtx.unlock();

    let t0 = Instant::now();
    while q.woken.lock().len() < 2 {
        assert!(t0.elapsed() < Duration::from_secs(5), "partial wake lost");
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(20));
    {
        let arrivals = q.arrivals.lock().clone();
        let woken = q.woken.lock().clone();
        assert_eq!(woken, arrivals[..2], "wrong waiters woken");
    }

    q.mtx.lock();
    q.wq.wake_all(&q.mtx);
    q.mtx.unlock();
    for t in threads {
        t.join();
    }
}

#[test]
fn is_empty_tracks_waiters() {
    setup();
    let q = Queue::new();
    q.mtx.lock();
    assert!(q.wq.is_empty(&q.mtx));
    q.mtx.unlock();

    let threads = park_waiters(&q, 1);
    all_arrived(&q, 1);
    q.mtx.lock();
    assert!(!q.wq.is_empty(&q.mtx));
    q.wq.wake_all(&q.mtx);
    q.mtx.unlock();
    for t in threads {
        t.join();
    }
    q.mtx.lock();
    assert!(q.wq.is_empty(&q.mtx));
    q.mtx.unlock();
}

// ── Condvar ─────────────────────────────────────────────────────

struct Cond {
    mtx: RawMutex,
    cv: Condvar,
    ready: AtomicBool,
    woken: AtomicUsize,
}

impl Cond {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mtx: RawMutex::new(),
            cv: Condvar::new(),
            ready: AtomicBool::new(false),
            woken: AtomicUsize::new(0),
        })
    }
}

#[test]
fn condvar_wakes_without_holding_the_mutex() {
    setup();
    let c = Cond::new();
    let c2 = c.clone();
    let t = Thread::spawn(
        move || {
            c2.mtx.lock();
            while !c2.ready.load(Ordering::Acquire) {
                c2.cv.wait(&c2.mtx);
            }
            c2.woken.fetch_add(1, Ordering::Release);
            c2.mtx.unlock();
        },
        Attr::new().name("cv-waiter"),
    );

    std::thread::sleep(Duration::from_millis(20));
    c.mtx.lock();
    c.ready.store(true, Ordering::Release);
    c.mtx.unlock();
    // Signalling after the unlock: plain wake path, no morphing.
    c.cv.notify_one();
    t.join();
    assert_eq!(c.woken.load(Ordering::Acquire), 1);
}

#[test]
fn condvar_wake_all_releases_everyone() {
    setup();
    const N: usize = 4;
    let c = Cond::new();
    let threads: Vec<_> = (0..N)
        .map(|i| {
            let c = c.clone();
            Thread::spawn(
                move || {
                    c.mtx.lock();
                    while !c.ready.load(Ordering::Acquire) {
                        c.cv.wait(&c.mtx);
                    }
                    c.woken.fetch_add(1, Ordering::Release);
                    c.mtx.unlock();
                },
                Attr::new().name(format!("cv-{i}")),
            )
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    c.mtx.lock();
    c.ready.store(true, Ordering::Release);
    // Waking with the mutex held: every waiter is morphed onto the mutex
    // and handed the lock in turn.
    c.cv.notify_all();
    c.mtx.unlock();
    for t in threads {
        t.join();
    }
    assert_eq!(c.woken.load(Ordering::Acquire), N);
}

#[test]
fn condvar_wait_timeout_expires() {
    setup();
    let c = Cond::new();
    c.mtx.lock();
    let t0 = Instant::now();
    let signalled = c.cv.wait_timeout(&c.mtx, Duration::from_millis(30));
    assert!(!signalled);
    assert!(t0.elapsed() >= Duration::from_millis(30));
    c.mtx.unlock();
}

#[test]
fn condvar_wait_timeout_sees_signal() {
    setup();
    let c = Cond::new();
    let c2 = c.clone();
    let signaller = Thread::spawn(
        move || {
            unios_sched::sleep(Duration::from_millis(20));
            c2.mtx.lock();
            c2.ready.store(true, Ordering::Release);
            c2.mtx.unlock();
            c2.cv.notify_one();
        },
        Attr::new().name("signaller"),
    );

    c.mtx.lock();
    let mut signalled = true;
    while !c.ready.load(Ordering::Acquire) {
        signalled = c.cv.wait_timeout(&c.mtx, Duration::from_secs(5));
        if !signalled {
            break;
        }
    }
    c.mtx.unlock();
    signaller.join();
    assert!(signalled);
    assert!(c.ready.load(Ordering::Acquire));
}

#[test]
fn notify_on_a_free_mutex_hands_the_lock_directly() {
    setup();
    // Nobody holds the mutex when the notify lands, so the morph has no
    // unlock coming to serve it; the hand-off must happen at notify
    // time. Lockstep so every round exercises that path.
    let c = Cond::new();
    let c2 = c.clone();
    let t = Thread::spawn(
        move || {
            for _ in 0..200 {
                c2.mtx.lock();
                while !c2.ready.swap(false, Ordering::AcqRel) {
                    c2.cv.wait(&c2.mtx);
                }
                c2.woken.fetch_add(1, Ordering::Release);
                c2.mtx.unlock();
            }
        },
        Attr::new().name("cv-receiver"),
    );
    let mut sent = 0;
    let t0 = Instant::now();
    while sent < 200 {
        assert!(t0.elapsed() < Duration::from_secs(10), "hand-off lost");
        if c.woken.load(Ordering::Acquire) == sent {
            c.ready.store(true, Ordering::Release);
            c.cv.notify_one();
            sent += 1;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    t.join();
}

#[test]
fn notify_while_the_waiter_relocks_is_a_plain_wake() {
    setup();
    // The waiter has timed out and is already asleep inside mtx.lock()
    // when the notify (holding the mutex) pops its record. Handing it
    // the lock through that record would name it owner while it still
    // sleeps on its own lock record, so it must get a plain wake and
    // take the mutex the ordinary way.
    let c = Cond::new();
    let c2 = c.clone();
    let waiter = Thread::spawn(
        move || {
            c2.mtx.lock();
            let signalled = c2.cv.wait_timeout(&c2.mtx, Duration::from_millis(10));
            if signalled {
                c2.woken.fetch_add(1, Ordering::Release);
            }
            c2.mtx.unlock();
        },
        Attr::new().name("relocker"),
    );
    // Hold the mutex well past the timeout so the waiter parks in lock().
    c.mtx.lock();
    let t0 = Instant::now();
    while waiter.status() != Status::Waiting || t0.elapsed() < Duration::from_millis(40) {
        assert!(t0.elapsed() < Duration::from_secs(5), "waiter never parked");
        std::thread::sleep(Duration::from_millis(1));
    }
    c.cv.notify_one();
    c.mtx.unlock();
    waiter.join();
    assert_eq!(c.woken.load(Ordering::Acquire), 1, "notify was lost");
}

#[test]
fn wait_timeout_racing_notify_cannot_deadlock() {
    setup();
    // The hazard: the waiter times out and is reacquiring the mutex just
    // as the notifier (holding it) pops the record and morphs it onto
    // that same mutex. The timed-out side must serve the pending
    // hand-off instead of spinning with the lock held.
    let c = Cond::new();
    let c2 = c.clone();
    let waiter = Thread::spawn(
        move || {
            for _ in 0..400 {
                c2.mtx.lock();
                c2.cv.wait_timeout(&c2.mtx, Duration::from_millis(1));
                c2.mtx.unlock();
            }
        },
        Attr::new().name("cv-timeout"),
    );
    let c3 = c.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let s2 = stop.clone();
    let notifier = Thread::spawn(
        move || {
            while !s2.load(Ordering::Acquire) {
                // Held across the notify to force the morph path.
                c3.mtx.lock();
                c3.cv.notify_one();
                c3.mtx.unlock();
            }
        },
        Attr::new().name("cv-notifier"),
    );
    let t0 = Instant::now();
    while waiter.status() != Status::Terminated {
        assert!(t0.elapsed() < Duration::from_secs(30), "waiter wedged");
        std::thread::sleep(Duration::from_millis(5));
    }
    waiter.join();
    stop.store(true, Ordering::Release);
    notifier.join();
}
