// =============================================================================
// UniOS — Sleeping Mutex with Lock Hand-Off
// =============================================================================
//
// A recursive sleeping mutex in which lockers and unlockers never spin on
// each other. Four words of state:
//
//   count    — lockers in flight: the holder plus everyone who has begun
//              acquiring. `fetch_add(1) == 0` is the uncontended grab.
//   owner    — id of the holding thread, 0 if none. Read for recursion
//              and for the final sanity check in unlock.
//   depth    — recursion depth; touched only by the owner.
//   handoff  — a token the unlocker leaves when it finds `count > 0` but
//              the wait queue momentarily empty (a locker is between its
//              fetch_add and its queue push). Whoever clears the token —
//              that locker, a try_lock, or the unlocker itself on a
//              second look — owns the lock or hands it to a waiter.
//
// THE RESPONSIBILITY HAND-OFF:
//   unlock() never returns leaving a waiter stranded: either it pops and
//   wakes a waiter directly (becoming responsible for setting owner and
//   depth before the wake), or it publishes a hand-off token and
//   re-checks the queue, looping until one side of the race is resolved.
//   Symmetrically, a locker that has pushed itself re-checks the token.
//
// SINGLE CONSUMER:
//   The wait queue is multi-producer single-consumer. Exclusivity of
//   pop() holds because only two parties ever pop: an unlocker before it
//   publishes a token, and the unique clearer of a published token.
//
// WAIT MORPHING:
//   send_lock_unless_already_waiting()/receive_lock() let a wait queue
//   move a sleeping thread directly onto this queue, so waking a condvar
//   waiter hands it the mutex instead of waking it twice. The morph is
//   refused for a thread that already has a record here: it is taking
//   the lock on its own, and a hand-off through a second record would
//   name it owner while it sleeps on the first.
// =============================================================================

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::queue_mpsc::QueueMpsc;
use super::WaitRecord;
use crate::sched::thread::{self, Thread};
use crate::sched::{self, Interrupted, WaitLock};

pub struct RawMutex {
    count: AtomicU32,
    owner: AtomicU64,
    depth: AtomicU32,
    waiters: QueueMpsc<WaitRecord>,
    handoff: AtomicU32,
    sequence: AtomicU32,
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            waiters: QueueMpsc::new(),
            handoff: AtomicU32::new(0),
            sequence: AtomicU32::new(0),
        }
    }

    /// Acquire the mutex, sleeping if necessary. Recursive: the owner may
    /// lock again and must unlock once per lock.
    pub fn lock(&self) {
        let me = thread::current();
        if self.count.fetch_add(1, Ordering::SeqCst) == 0 {
            // Uncontended.
            self.owner.store(me.id(), Ordering::Relaxed);
            debug_assert_eq!(self.depth.load(Ordering::Relaxed), 0);
            self.depth.store(1, Ordering::Relaxed);
            return;
        }
        if self.owner.load(Ordering::Relaxed) == me.id() {
            // Recursive acquisition; undo our count contribution.
            self.count.fetch_sub(1, Ordering::Relaxed);
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Contended: queue ourselves and sleep until an unlock hands us
        // the lock. The record lives on this frame; we return only after
        // it has been popped and we were named owner. Push before the
        // first prepare_wait: whoever finds this thread claimable in
        // Waiting state must also find its record on this queue.
        let wr = WaitRecord::new(me.clone());
        unsafe { self.waiters.push(&wr as *const _ as *mut _) };
        self.resolve_handoff();
        loop {
            me.prepare_wait();
            if wr.woken() {
                break;
            }
            me.wait();
        }
        me.stop_wait();
        // Consume the hand-off tag; we are awake and know we own it.
        let _ = me.take_lock_sent();
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), me.id());
    }

    /// Acquire without sleeping. May spuriously fail while an unlock is
    /// mid-flight.
    pub fn try_lock(&self) -> bool {
        let me = thread::current();
        if self
            .count
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me.id(), Ordering::Relaxed);
            self.depth.store(1, Ordering::Relaxed);
            return true;
        }
        if self.owner.load(Ordering::Relaxed) == me.id() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        // Last chance: adopt an abandoned hand-off token.
        let token = self.handoff.load(Ordering::SeqCst);
        if token != 0
            && self
                .handoff
                .compare_exchange(token, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.owner.store(me.id(), Ordering::Relaxed);
            self.depth.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Release the mutex. Panics if the caller does not own it.
    pub fn unlock(&self) {
        let me = thread::current();
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            me.id(),
            "mutex unlocked by thread '{}' which does not own it",
            me.name()
        );
        let d = self.depth.load(Ordering::Relaxed);
        debug_assert!(d > 0);
        if d > 1 {
            self.depth.store(d - 1, Ordering::Relaxed);
            return;
        }
        self.owner.store(0, Ordering::Relaxed);
        self.depth.store(0, Ordering::Relaxed);
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            // No waiters in flight.
            sched::preempt_point();
            return;
        }
        loop {
            // SAFETY: single consumer — no hand-off token of ours is
            // published yet, so nobody else may pop.
            let wr = unsafe { self.waiters.pop() };
            if !wr.is_null() {
                self.hand_to(unsafe { &*wr });
                sched::preempt_point();
                return;
            }
            // Queue empty but count says someone is coming: leave a token
            // for the locker caught between its fetch_add and its push.
            let token = self.next_token();
            self.handoff.store(token, Ordering::SeqCst);
            if self.waiters.is_empty() {
                // They will find the token (or a try_lock will).
                sched::preempt_point();
                return;
            }
            // A waiter appeared after all; take our token back and serve
            // it — unless someone else already claimed the token.
            if self
                .handoff
                .compare_exchange(token, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                sched::preempt_point();
                return;
            }
        }
    }

    fn next_token(&self) -> u32 {
        loop {
            let t = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if t != 0 {
                return t;
            }
        }
    }

    /// Hand the lock to a popped waiter: name it owner, then wake it.
    /// The record must not be touched after the wake.
    fn hand_to(&self, wr: &WaitRecord) {
        let t = wr.thread().clone();
        self.depth.store(1, Ordering::Relaxed);
        self.owner.store(t.id(), Ordering::Release);
        wr.wake();
    }

    /// Pick up a hand-off token if one is published and a waiter (maybe
    /// us) is queued. Called by lockers after pushing their record.
    fn resolve_handoff(&self) {
        let token = self.handoff.load(Ordering::SeqCst);
        if token == 0 || self.waiters.is_empty() {
            return;
        }
        if self
            .handoff
            .compare_exchange(token, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // SAFETY: clearing the token grants the pop right. The queue
            // cannot be empty here: a record pushed before the token was
            // published would have been popped by the unlocker, and our
            // own record is pushed before this call.
            let wr = unsafe { self.waiters.pop() };
            debug_assert!(!wr.is_null());
            self.hand_to(unsafe { &*wr });
        }
    }

    // ── Wait morphing ───────────────────────────────────────────

    /// Queue a foreign wait record whose thread is in SendingLock state;
    /// the next unlock (or hand-off resolution) will hand it the lock.
    /// Refused (false) if that thread already has a record on this queue:
    /// it bailed out of its outer wait and is taking the lock itself, so
    /// it must get a plain wake instead of a second hand-off.
    ///
    /// The caller must hold the mutex. That parks the queue's single
    /// consumer, so records may be pushed during the scan but never
    /// popped or invalidated, and it pins `count` above zero.
    pub(crate) fn send_lock_unless_already_waiting(
        &self,
        wr: *mut WaitRecord,
        t: &Arc<Thread>,
    ) -> bool {
        debug_assert!(self.held_by_current());
        if unsafe { self.waiters.any(|r| r.thread().id() == t.id()) } {
            return false;
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        unsafe { self.waiters.push(wr) };
        self.resolve_handoff();
        true
    }

    /// Hand the lock straight to `wr`'s thread if the mutex is entirely
    /// free — a condvar notified with nobody holding the user mutex,
    /// where no unlock would ever come to serve a queued record.
    pub(crate) fn try_send_lock_free(&self, wr: *mut WaitRecord) -> bool {
        if self
            .count
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.hand_to(unsafe { &*wr });
        true
    }

    /// Called by a thread that was handed the lock in its sleep; by the
    /// time it runs, the hand-off has already named it owner.
    pub(crate) fn receive_lock(&self) {
        debug_assert_eq!(
            self.owner.load(Ordering::Relaxed),
            thread::current().id(),
            "receive_lock without a hand-off"
        );
        debug_assert_eq!(self.depth.load(Ordering::Relaxed), 1);
    }

    /// True if the calling thread holds the mutex.
    pub fn held_by_current(&self) -> bool {
        thread::try_current()
            .map(|t| self.owner.load(Ordering::Relaxed) == t.id())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn recursion_depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    // ── Waiting on a condition under this mutex ─────────────────

    /// Sleep until `pred` holds, releasing the mutex across each sleep.
    /// The mutex is held on entry, while `pred` runs, and on return.
    pub fn wait_until(&self, pred: impl FnMut() -> bool) {
        debug_assert!(self.held_by_current());
        let r = thread::do_wait_until::<false, _, _>(self, pred);
        debug_assert!(r.is_ok());
    }

    /// Like [`wait_until`](Self::wait_until), but interruptible. On
    /// `Err(Interrupted)` the mutex is still held.
    pub fn wait_until_interruptible(
        &self,
        pred: impl FnMut() -> bool,
    ) -> Result<(), Interrupted> {
        debug_assert!(self.held_by_current());
        thread::do_wait_until::<true, _, _>(self, pred)
    }
}

impl WaitLock for RawMutex {
    fn release(&self) {
        self.unlock();
    }
    fn reacquire(&self, me: &Arc<Thread>) {
        if me.take_lock_sent() {
            self.receive_lock();
        } else {
            self.lock();
        }
    }
}

// =============================================================================
// Data-carrying wrapper
// =============================================================================

/// A mutex protecting a value, in the style every caller actually wants:
/// `lock()` returns a guard, the guard derefs to the data, dropping the
/// guard unlocks.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// SAFETY: the mutex serializes access to T, so sharing the mutex is safe
// whenever sending T is.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// The underlying raw mutex, for use with wait queues and condvars.
    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard; the lock is held exactly as long as this lives.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    // Ownership is per-thread; the guard must not cross threads.
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
