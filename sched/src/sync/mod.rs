//! Sleeping synchronization primitives.
//!
//! The mutex, wait queue, condvar and RCU all build on two pieces: the
//! thread status machine in [`crate::sched::thread`] and the
//! [`WaitRecord`], a stack-allocated node that links a sleeping thread
//! into whichever queue will wake it.

pub mod mutex;
pub(crate) mod queue_mpsc;
pub mod rcu;
pub mod waitqueue;

pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use waitqueue::{Condvar, WaitQueue};

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::sched::thread::{StatusMask, Thread};

/// A record of one sleeping thread, allocated on the waiter's stack.
///
/// This is sound because a blocked host thread's stack frame cannot move
/// or unwind: the waiter only returns (invalidating the record) after it
/// observes `woken`, and wakers never touch a record after setting it.
pub(crate) struct WaitRecord {
    thread: Arc<Thread>,
    woken: AtomicBool,
    /// Intrusive link, used by both the mutex's MPSC queue and the wait
    /// queue's FIFO.
    next: AtomicPtr<WaitRecord>,
}

impl WaitRecord {
    pub(crate) fn new(thread: Arc<Thread>) -> Self {
        Self {
            thread,
            woken: AtomicBool::new(false),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub(crate) fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub(crate) fn woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Mutex hand-off wake: the popped waiter is now the lock owner.
    ///
    /// Everything after the `woken` store runs on a cloned handle only —
    /// the record may be invalidated the instant the owner-to-be observes
    /// the flag.
    pub(crate) fn wake(&self) {
        let t = self.thread.clone();
        t.set_lock_sent();
        self.woken.store(true, Ordering::Release);
        t.wake_impl(StatusMask::WAITING | StatusMask::SENDING_LOCK);
    }

    /// Plain wake for a popped record: the thread contends for any lock
    /// by itself.
    pub(crate) fn wake_plain(&self) {
        let t = self.thread.clone();
        self.woken.store(true, Ordering::Release);
        t.wake_impl(StatusMask::WAITING);
    }

    /// Wake a record popped from a wait queue, morphing the sleeper onto
    /// `mtx`'s queue when possible so it is handed the lock instead of
    /// being woken just to contend for it.
    ///
    /// The morph happens only when it is sound: the sleeper must be fully
    /// asleep and must not already have a record on `mtx` — a thread
    /// sleeping inside `mtx.lock()` itself would be named owner while
    /// still waiting on its own record. A waker that does not hold `mtx`
    /// may still hand over a completely free mutex; in every other case
    /// this falls back to a plain wake.
    pub(crate) fn wake_lock(&self, mtx: &RawMutex) {
        let t = self.thread.clone();
        if !t.begin_send_lock() {
            // Running or mid-wake: it re-acquires by itself.
            self.wake_plain();
            return;
        }
        let sent = if mtx.held_by_current() {
            mtx.send_lock_unless_already_waiting(self as *const _ as *mut _, &t)
        } else {
            // Nobody holds the mutex, so no unlock would serve a queued
            // record; hand it over only if it is entirely free.
            mtx.try_send_lock_free(self as *const _ as *mut _)
        };
        if sent {
            // The record now belongs to the mutex; its eventual unlock
            // wakes the thread with the lock already held.
            return;
        }
        t.end_send_lock();
        self.wake_plain();
    }
}

impl queue_mpsc::Node for WaitRecord {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}
