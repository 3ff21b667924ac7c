//! Timers, sleeps, multi-object waits and the BSD sleep/wakeup shim.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use unios_sched::compat::{self, SleepResult};
use unios_sched::sched::thread::Status;
use unios_sched::sync::waitqueue::wait_for;
use unios_sched::{kernel, Attr, Config, RawMutex, Thread, Timer, WaitQueue};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    kernel::init(Config::new().cpus(2));
}

#[test]
fn sleep_lasts_at_least_the_requested_time() {
    setup();
    let t0 = Instant::now();
    unios_sched::sleep(Duration::from_millis(50));
    assert!(t0.elapsed() >= Duration::from_millis(50));
}

#[test]
fn cancelled_timer_never_fires() {
    setup();
    let t = Timer::new();
    t.set(Duration::from_millis(20));
    t.cancel();
    std::thread::sleep(Duration::from_millis(60));
    assert!(!t.expired());
}

#[test]
fn rearming_resets_the_deadline() {
    setup();
    let t = Timer::new();
    t.set(Duration::from_secs(60));
    t.set(Duration::from_millis(10));
    let t0 = Instant::now();
    unios_sched::wait_until(|| t.expired());
    assert!(t0.elapsed() < Duration::from_secs(10));
}

#[test]
fn interruptible_sleep_aborts_early() {
    setup();
    let result = Arc::new(AtomicU8::new(0));
    let r2 = result.clone();
    let t = Thread::spawn(
        move || {
            let r = unios_sched::sleep_interruptible(Duration::from_secs(30));
            r2.store(if r.is_err() { 2 } else { 1 }, Ordering::Release);
        },
        Attr::new().name("long-sleeper"),
    );
    std::thread::sleep(Duration::from_millis(20));
    t.interrupt();
    t.join();
    assert_eq!(result.load(Ordering::Acquire), 2, "sleep was not interrupted");
}

// ── wait_for: first of several objects ──────────────────────────

struct Port {
    mtx: RawMutex,
    wq: WaitQueue,
}

#[test]
fn wait_for_returns_on_timer_expiry() {
    setup();
    let p = Port {
        mtx: RawMutex::new(),
        wq: WaitQueue::new(),
    };
    let timer = Timer::new();
    timer.set(Duration::from_millis(30));
    p.mtx.lock();
    let waiter = p.wq.waiter();
    wait_for(&p.mtx, &[&waiter, &timer]);
    assert!(timer.expired());
    assert!(!waiter.woken());
    p.mtx.unlock();
}

#[test]
fn wait_for_returns_on_wakeup_before_timer() {
    setup();
    let p = Arc::new(Port {
        mtx: RawMutex::new(),
        wq: WaitQueue::new(),
    });
    let p2 = p.clone();
    let waker = Thread::spawn(
        move || {
            unios_sched::sleep(Duration::from_millis(20));
            p2.mtx.lock();
            p2.wq.wake_one(&p2.mtx);
            p2.mtx.unlock();
        },
        Attr::new().name("port-waker"),
    );

    let timer = Timer::new();
    timer.set(Duration::from_secs(30));
    p.mtx.lock();
    let waiter = p.wq.waiter();
    wait_for(&p.mtx, &[&waiter, &timer]);
    assert!(waiter.woken());
    assert!(!timer.expired());
    p.mtx.unlock();
    waker.join();
}

// ── msleep / wakeup ─────────────────────────────────────────────

const RESULT_PENDING: u8 = 0;
const RESULT_WOKEN: u8 = 1;
const RESULT_TIMEOUT: u8 = 2;
const RESULT_INTERRUPTED: u8 = 3;

fn encode(r: SleepResult) -> u8 {
    match r {
        SleepResult::Woken => RESULT_WOKEN,
        SleepResult::Timeout => RESULT_TIMEOUT,
        SleepResult::Interrupted => RESULT_INTERRUPTED,
    }
}

#[test]
fn msleep_times_out() {
    setup();
    let t0 = Instant::now();
    let r = compat::msleep(0x1000, Some(Duration::from_millis(30)));
    assert_eq!(r, SleepResult::Timeout);
    assert!(t0.elapsed() >= Duration::from_millis(30));
}

#[test]
fn msleep_is_woken_by_wakeup() {
    setup();
    let result = Arc::new(AtomicU8::new(RESULT_PENDING));
    let r2 = result.clone();
    let t = Thread::spawn(
        move || {
            r2.store(encode(compat::msleep(0x2000, None)), Ordering::Release);
        },
        Attr::new().name("channel-sleeper"),
    );
    // Keep knocking: a wakeup issued before the sleeper reaches the
    // channel wakes nobody, by contract.
    let t0 = Instant::now();
    while result.load(Ordering::Acquire) == RESULT_PENDING {
        assert!(t0.elapsed() < Duration::from_secs(5), "wakeup never landed");
        compat::wakeup(0x2000);
        std::thread::sleep(Duration::from_millis(5));
    }
    t.join();
    assert_eq!(result.load(Ordering::Acquire), RESULT_WOKEN);
}

#[test]
fn msleep_can_be_interrupted() {
    setup();
    let result = Arc::new(AtomicU8::new(RESULT_PENDING));
    let r2 = result.clone();
    let t = Thread::spawn(
        move || {
            r2.store(encode(compat::msleep(0x3000, None)), Ordering::Release);
        },
        Attr::new().name("interruptee"),
    );
    std::thread::sleep(Duration::from_millis(20));
    t.interrupt();
    t.join();
    assert_eq!(result.load(Ordering::Acquire), RESULT_INTERRUPTED);
}

#[test]
fn wakeup_one_rouses_a_single_sleeper() {
    setup();
    let results: Vec<Arc<AtomicU8>> = (0..2).map(|_| Arc::new(AtomicU8::new(0))).collect();
    let threads: Vec<_> = results
        .iter()
        .map(|r| {
            let r = r.clone();
            Thread::spawn(
                move || {
                    r.store(encode(compat::msleep(0x4000, None)), Ordering::Release);
                },
                Attr::new(),
            )
        })
        .collect();

    // Release them with single wakeups. Each wakeup_one rouses at most
    // one sleeper; two are needed before both report in.
    let woken = |rs: &[Arc<AtomicU8>]| {
        rs.iter()
            .filter(|r| r.load(Ordering::Acquire) == RESULT_WOKEN)
            .count()
    };
    std::thread::sleep(Duration::from_millis(30));
    let t0 = Instant::now();
    while woken(&results) < 1 {
        assert!(t0.elapsed() < Duration::from_secs(5));
        compat::wakeup_one(0x4000);
        std::thread::sleep(Duration::from_millis(2));
    }
    while woken(&results) < 2 {
        assert!(t0.elapsed() < Duration::from_secs(5));
        compat::wakeup_one(0x4000);
        std::thread::sleep(Duration::from_millis(2));
    }
    for t in threads {
        t.join();
    }
    assert!(results
        .iter()
        .all(|r| r.load(Ordering::Acquire) == RESULT_WOKEN));
}

#[test]
fn msleep_timeout_racing_wakeup_cannot_deadlock() {
    setup();
    // Short timeouts against a tight wakeup loop: the sleeper keeps
    // timing out exactly as the waker (holding the channel mutex) pops
    // its record, so the pending wake must be served on the timeout
    // path, not spun on with the mutex held.
    const CHAN: usize = 0x5000;
    let sleeper = Thread::spawn(
        move || {
            for _ in 0..400 {
                compat::msleep(CHAN, Some(Duration::from_millis(1)));
            }
        },
        Attr::new().name("napper"),
    );
    let stop = Arc::new(AtomicBool::new(false));
    let s2 = stop.clone();
    let waker = Thread::spawn(
        move || {
            while !s2.load(Ordering::Acquire) {
                compat::wakeup_one(CHAN);
            }
        },
        Attr::new().name("knocker"),
    );
    let t0 = Instant::now();
    while sleeper.status() != Status::Terminated {
        assert!(t0.elapsed() < Duration::from_secs(30), "sleeper wedged");
        std::thread::sleep(Duration::from_millis(5));
    }
    sleeper.join();
    stop.store(true, Ordering::Release);
    waker.join();
}
