//! Thread scheduling — threads, virtual CPUs, run queues, timers.
//!
//! The free functions here are the surface most code uses: [`current`],
//! [`yield_now`], [`sleep`], [`wait_until`] and friends all operate on the
//! calling thread.

pub mod clock;
pub(crate) mod cpu;
pub(crate) mod runqueue;
pub mod thread;
pub mod timer;

use core::cell::Cell;
use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use crate::kernel;
use thread::Thread;

// ── Wait errors ─────────────────────────────────────────────────

/// An interruptible wait was cut short by [`Thread::interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("wait interrupted")
    }
}

impl std::error::Error for Interrupted {}

// ── Preemption control ──────────────────────────────────────────

std::thread_local! {
    /// Per-thread preemption-disable depth. While non-zero the thread will
    /// not be switched out at preemption points, and blocking is a bug.
    static PREEMPT_COUNT: Cell<u32> = const { Cell::new(0) };
}

#[inline]
pub(crate) fn preempt_count() -> u32 {
    PREEMPT_COUNT.with(|c| c.get())
}

#[inline]
pub(crate) fn preempt_disable() {
    PREEMPT_COUNT.with(|c| c.set(c.get() + 1));
}

#[inline]
pub(crate) fn preempt_enable() {
    PREEMPT_COUNT.with(|c| {
        let n = c.get();
        debug_assert!(n > 0, "unbalanced preempt_enable");
        c.set(n - 1);
    });
}

/// Honor a pending preemption request on the calling thread's CPU.
///
/// Cheap when nothing is pending (one thread-local read and one relaxed
/// atomic load). Compute-bound loops should call this regularly; every
/// other suspension point (lock slow path, unlock, wake, yield, sleep)
/// already does.
pub fn preempt_point() {
    if preempt_count() > 0 {
        return;
    }
    let Some(me) = thread::try_current() else {
        return;
    };
    if me.is_adopted() {
        return;
    }
    let k = kernel::get();
    let cpu = k.cpu(me.cpu_id());
    cpu.note_quiescent();
    if cpu.take_need_resched() {
        cpu.preempt(&me);
    }
}

// ── Calling-thread operations ───────────────────────────────────

/// The calling thread's handle.
///
/// A host thread that was not created through [`Thread::make`] is adopted
/// on first contact: it gets a thread record with no home CPU, blocks by
/// parking and is woken by unparking.
pub fn current() -> Arc<Thread> {
    thread::current()
}

/// The index of the CPU the calling thread last ran on, if it has one.
pub fn current_cpu() -> Option<usize> {
    let me = thread::try_current()?;
    if me.is_adopted() {
        None
    } else {
        Some(me.cpu_id() as usize)
    }
}

/// Give up the CPU to the best queued thread, if any.
pub fn yield_now() {
    let Some(me) = thread::try_current() else {
        std::thread::yield_now();
        return;
    };
    if me.is_adopted() {
        std::thread::yield_now();
        return;
    }
    // Same rule as blocking: being switched out inside a critical
    // section would let a grace period end under a live read guard.
    assert_eq!(
        preempt_count(),
        0,
        "thread '{}' yielded with preemption disabled",
        me.name()
    );
    let k = kernel::get();
    k.cpu(me.cpu_id()).yield_current(&me);
}

/// Block the calling thread until `pred` returns true.
///
/// The predicate is re-evaluated after every wakeup; callers are woken with
/// [`Thread::wake`]. The predicate must not itself sleep.
pub fn wait_until(pred: impl FnMut() -> bool) {
    let r = thread::do_wait_until::<false, _, _>(&NoLock, pred);
    debug_assert!(r.is_ok());
}

/// Like [`wait_until`], but [`Thread::interrupt`] aborts the wait.
/// The interruption flag is consumed by the failing return.
pub fn wait_until_interruptible(pred: impl FnMut() -> bool) -> Result<(), Interrupted> {
    thread::do_wait_until::<true, _, _>(&NoLock, pred)
}

/// Block the calling thread for at least `dur`.
pub fn sleep(dur: Duration) {
    let t = timer::Timer::new();
    t.set(dur);
    wait_until(|| t.expired());
}

/// Like [`sleep`], but [`Thread::interrupt`] aborts the sleep early.
pub fn sleep_interruptible(dur: Duration) -> Result<(), Interrupted> {
    let t = timer::Timer::new();
    t.set(dur);
    wait_until_interruptible(|| t.expired())
}

/// Pin the calling thread to `cpu`, migrating there if necessary.
pub fn pin_self(cpu: usize) {
    let me = thread::current();
    assert!(!me.is_adopted(), "cannot pin an adopted thread");
    let k = kernel::get();
    assert!(cpu < k.num_cpus(), "no such cpu: {cpu}");
    me.set_pinned(true);
    let target = cpu as u32;
    if me.cpu_id() != target {
        k.cpu(me.cpu_id()).migrate_current(&me, target);
    }
}

// ── Mutex participation in waits ────────────────────────────────

/// How a wait loop releases and regains an associated lock around each
/// sleep. The mutex implementation supplies the interesting version; plain
/// waits use [`NoLock`].
pub(crate) trait WaitLock {
    fn release(&self);
    /// Regain the lock after a wakeup. A mutex implementation must check
    /// for a lock handed over by wait morphing before contending normally.
    fn reacquire(&self, me: &Arc<Thread>);
}

/// No lock associated with the wait.
pub(crate) struct NoLock;

impl WaitLock for NoLock {
    fn release(&self) {}
    fn reacquire(&self, _me: &Arc<Thread>) {}
}
