// =============================================================================
// UniOS — Wait Queues and Condition Variables
// =============================================================================
//
// A WaitQueue is a FIFO of stack-allocated wait records, protected by a
// mutex the caller supplies — the same mutex that protects the condition
// being waited on. Waking is where the interesting part lives:
//
// WAIT MORPHING:
//   wake_one() pops the oldest record and, if its thread is fully asleep,
//   does not wake it. Instead the thread is moved onto the mutex's own
//   wait queue (`send_lock_unless_already_waiting`), so the next unlock
//   hands it the mutex and wakes it exactly once, already holding the
//   lock. Without this, waking n waiters while holding the mutex causes
//   n wakeups followed by n-1 immediate blocks on the mutex. The morph is
//   refused — a plain wake is sent instead — when the sleeper is already
//   waiting on the mutex itself, or when the waker holds neither the
//   mutex nor the guarantee that it is free.
//
// The Condvar is the same machinery with its own internal lock instead of
// borrowing the user's, so it can be signalled without holding the mutex.
// =============================================================================

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::Ordering;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use super::mutex::RawMutex;
use super::WaitRecord;
use crate::sched::thread::{self, Thread};
use crate::sched::{self, Interrupted};

// ── Intrusive FIFO of wait records ──────────────────────────────

/// Oldest-first singly-linked list through `WaitRecord::next`.
/// All access must be serialized by the caller.
struct Fifo {
    oldest: *mut WaitRecord,
    newest: *mut WaitRecord,
}

impl Fifo {
    const fn new() -> Self {
        Self {
            oldest: ptr::null_mut(),
            newest: ptr::null_mut(),
        }
    }

    unsafe fn push_back(&mut self, wr: *mut WaitRecord) {
        use super::queue_mpsc::Node;
        (*wr).next_link().store(ptr::null_mut(), Ordering::Relaxed);
        if self.newest.is_null() {
            self.oldest = wr;
        } else {
            (*self.newest).next_link().store(wr, Ordering::Relaxed);
        }
        self.newest = wr;
    }

    unsafe fn pop_front(&mut self) -> *mut WaitRecord {
        use super::queue_mpsc::Node;
        let wr = self.oldest;
        if !wr.is_null() {
            self.oldest = (*wr).next_link().load(Ordering::Relaxed);
            if self.oldest.is_null() {
                self.newest = ptr::null_mut();
            }
        }
        wr
    }

    /// Remove a specific record; true if it was still linked.
    unsafe fn unlink(&mut self, target: *mut WaitRecord) -> bool {
        use super::queue_mpsc::Node;
        let mut prev: *mut WaitRecord = ptr::null_mut();
        let mut cur = self.oldest;
        while !cur.is_null() {
            let next = (*cur).next_link().load(Ordering::Relaxed);
            if cur == target {
                if prev.is_null() {
                    self.oldest = next;
                } else {
                    (*prev).next_link().store(next, Ordering::Relaxed);
                }
                if self.newest == target {
                    self.newest = prev;
                }
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    fn is_empty(&self) -> bool {
        self.oldest.is_null()
    }
}

// ── WaitQueue ───────────────────────────────────────────────────

/// A FIFO wait queue guarded by a caller-supplied mutex.
///
/// Every operation requires that mutex to be held; this is asserted.
pub struct WaitQueue {
    fifo: UnsafeCell<Fifo>,
}

// SAFETY: all access to the inner FIFO is serialized by the mutex the
// callers are required (and asserted) to hold.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            fifo: UnsafeCell::new(Fifo::new()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn fifo(&self) -> &mut Fifo {
        &mut *self.fifo.get()
    }

    /// Sleep until a waker pops us. `mtx` is held on entry, released
    /// across the sleep, and held again on return — possibly handed to us
    /// directly by wait morphing.
    pub fn wait(&self, mtx: &RawMutex) {
        assert!(mtx.held_by_current(), "waitqueue used without its mutex");
        let me = thread::current();
        let wr = WaitRecord::new(me.clone());
        // SAFETY: the record outlives the wait; we return only after a
        // waker has popped it and set `woken`.
        unsafe { self.fifo().push_back(&wr as *const _ as *mut _) };
        mtx.unlock();
        sched::wait_until(|| wr.woken());
        reacquire(&me, mtx);
    }

    /// Wake the oldest waiter, if any. Requires `mtx` held.
    pub fn wake_one(&self, mtx: &RawMutex) {
        assert!(mtx.held_by_current(), "waitqueue used without its mutex");
        let wr = unsafe { self.fifo().pop_front() };
        if !wr.is_null() {
            unsafe { &*wr }.wake_lock(mtx);
        }
    }

    /// Wake up to `n` waiters, oldest first. Requires `mtx` held.
    pub fn wake_some(&self, mtx: &RawMutex, n: usize) {
        assert!(mtx.held_by_current(), "waitqueue used without its mutex");
        for _ in 0..n {
            let wr = unsafe { self.fifo().pop_front() };
            if wr.is_null() {
                return;
            }
            unsafe { &*wr }.wake_lock(mtx);
        }
    }

    /// Wake every waiter, oldest first. Requires `mtx` held.
    ///
    /// With wait morphing this serializes the sleepers onto the mutex:
    /// each is handed the lock in turn as the previous one releases it.
    pub fn wake_all(&self, mtx: &RawMutex) {
        self.wake_some(mtx, usize::MAX);
    }

    /// True if no thread is currently waiting. Requires `mtx` held.
    pub fn is_empty(&self, mtx: &RawMutex) -> bool {
        debug_assert!(mtx.held_by_current());
        unsafe { self.fifo() }.is_empty()
    }

    /// A waitable handle for [`wait_for`], armed under the same mutex.
    pub fn waiter(&self) -> Waiter<'_> {
        Waiter {
            wq: self,
            wr: WaitRecord::new(thread::current()),
        }
    }
}

/// After any wakeup: either the lock was morphed over to us, or we take
/// it the ordinary way.
fn reacquire(me: &Arc<Thread>, mtx: &RawMutex) {
    if me.take_lock_sent() {
        mtx.receive_lock();
    } else {
        mtx.lock();
    }
}

/// Finish a wake already claimed by a waker: our record was popped, but
/// `woken` is not set yet. Either a plain wake is a few instructions from
/// landing, or the waker morphed us onto `mtx`'s own queue — and then
/// only a later unlock of `mtx` completes the wake. We hold `mtx` here,
/// so waiting with it held would wait for ourselves: release it, sleep
/// the wake out, and take the lock back (or receive it from the
/// hand-off).
fn serve_pending_wake(me: &Arc<Thread>, mtx: &RawMutex, wr: &WaitRecord) {
    mtx.unlock();
    sched::wait_until(|| wr.woken());
    reacquire(me, mtx);
}

// ── Multi-object waits ──────────────────────────────────────────

/// Something [`wait_for`] can block on. All objects in one wait share the
/// same mutex, which is held for `arm` and `disarm`.
pub trait Waitable {
    /// Has the event fired? Called with and without the mutex held.
    fn poll(&self) -> bool;
    fn arm(&self, mtx: &RawMutex);
    fn disarm(&self, mtx: &RawMutex);
}

/// One armed position in a [`WaitQueue`], for use with [`wait_for`].
pub struct Waiter<'a> {
    wq: &'a WaitQueue,
    wr: WaitRecord,
}

impl Waiter<'_> {
    /// True if a waker popped this waiter.
    pub fn woken(&self) -> bool {
        self.wr.woken()
    }
}

impl Waitable for Waiter<'_> {
    fn poll(&self) -> bool {
        self.wr.woken()
    }

    fn arm(&self, mtx: &RawMutex) {
        debug_assert!(mtx.held_by_current());
        // SAFETY: wait_for disarms before returning, and the Waiter is
        // pinned behind a reference for the duration.
        unsafe {
            self.wq
                .fifo()
                .push_back(&self.wr as *const _ as *mut _)
        };
    }

    fn disarm(&self, mtx: &RawMutex) {
        debug_assert!(mtx.held_by_current());
        if self.wr.woken() {
            return;
        }
        if unsafe { self.wq.fifo().unlink(&self.wr as *const _ as *mut _) } {
            return;
        }
        serve_pending_wake(&thread::current(), mtx, &self.wr);
    }
}

/// Block until at least one of `objs` has fired.
///
/// `mtx` is held on entry and on return and protects every object's
/// armed state. On return the caller inspects each object's `poll` to
/// see which fired; all of them are disarmed.
pub fn wait_for(mtx: &RawMutex, objs: &[&dyn Waitable]) {
    let r = wait_for_common::<false>(mtx, objs);
    debug_assert!(r.is_ok());
}

/// [`wait_for`], interruptible. On `Err(Interrupted)` the mutex is held
/// and all objects are disarmed.
pub fn wait_for_interruptible(
    mtx: &RawMutex,
    objs: &[&dyn Waitable],
) -> Result<(), Interrupted> {
    wait_for_common::<true>(mtx, objs)
}

fn wait_for_common<const INTERRUPTIBLE: bool>(
    mtx: &RawMutex,
    objs: &[&dyn Waitable],
) -> Result<(), Interrupted> {
    assert!(mtx.held_by_current(), "wait_for without its mutex");
    if objs.iter().any(|o| o.poll()) {
        return Ok(());
    }
    let me = thread::current();
    for o in objs {
        o.arm(mtx);
    }
    mtx.unlock();
    let result = if INTERRUPTIBLE {
        sched::wait_until_interruptible(|| objs.iter().any(|o| o.poll()))
    } else {
        sched::wait_until(|| objs.iter().any(|o| o.poll()));
        Ok(())
    };
    reacquire(&me, mtx);
    for o in objs {
        o.disarm(mtx);
    }
    result
}

// ── Condition variable ──────────────────────────────────────────

struct CondvarList {
    fifo: Fifo,
    /// The user mutex captured at first wait; all waiters of one condvar
    /// must use the same mutex, which is what makes signalling without
    /// holding it sound.
    user_mutex: *const RawMutex,
}

/// A condition variable with wait morphing.
///
/// Unlike [`WaitQueue`], a condvar may be signalled without holding the
/// associated mutex.
pub struct Condvar {
    inner: SpinMutex<CondvarList>,
}

// SAFETY: the raw pointers inside are only dereferenced while valid (the
// waiter keeps the mutex alive across its wait) and all list access is
// under the internal spinlock.
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(CondvarList {
                fifo: Fifo::new(),
                user_mutex: ptr::null(),
            }),
        }
    }

    /// Release `mtx`, sleep until signalled, and return with `mtx` held.
    pub fn wait(&self, mtx: &RawMutex) {
        assert!(mtx.held_by_current(), "condvar wait without its mutex");
        let me = thread::current();
        let wr = WaitRecord::new(me.clone());
        {
            let mut l = self.inner.lock();
            assert!(
                l.user_mutex.is_null() || ptr::eq(l.user_mutex, mtx),
                "condvar used with two different mutexes"
            );
            l.user_mutex = mtx;
            unsafe { l.fifo.push_back(&wr as *const _ as *mut _) };
        }
        mtx.unlock();
        sched::wait_until(|| wr.woken());
        reacquire(&me, mtx);
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns true if
    /// signalled, false if the timeout elapsed first.
    pub fn wait_timeout(&self, mtx: &RawMutex, dur: core::time::Duration) -> bool {
        assert!(mtx.held_by_current(), "condvar wait without its mutex");
        let me = thread::current();
        let wr = WaitRecord::new(me.clone());
        {
            let mut l = self.inner.lock();
            assert!(
                l.user_mutex.is_null() || ptr::eq(l.user_mutex, mtx),
                "condvar used with two different mutexes"
            );
            l.user_mutex = mtx;
            unsafe { l.fifo.push_back(&wr as *const _ as *mut _) };
        }
        let timer = crate::sched::timer::Timer::new();
        timer.set(dur);
        mtx.unlock();
        sched::wait_until(|| wr.woken() || timer.expired());
        let received = me.take_lock_sent();
        if received {
            mtx.receive_lock();
        } else {
            mtx.lock();
        }
        if wr.woken() || received {
            return true;
        }
        // Timed out. Pull the record back out — unless a waker already
        // popped it, in which case its wake must be consumed before the
        // record goes out of scope.
        if unsafe { self.inner.lock().fifo.unlink(&wr as *const _ as *mut _) } {
            return false;
        }
        serve_pending_wake(&me, mtx, &wr);
        true
    }

    /// Wake the oldest waiter, handing it the mutex if it is asleep.
    pub fn notify_one(&self) {
        let (wr, mtx) = {
            let mut l = self.inner.lock();
            (unsafe { l.fifo.pop_front() }, l.user_mutex)
        };
        if !wr.is_null() {
            unsafe { (&*wr).wake_lock(&*mtx) };
        }
    }

    /// Wake every waiter in FIFO order.
    pub fn notify_all(&self) {
        loop {
            let (wr, mtx) = {
                let mut l = self.inner.lock();
                (unsafe { l.fifo.pop_front() }, l.user_mutex)
            };
            if wr.is_null() {
                return;
            }
            unsafe { (&*wr).wake_lock(&*mtx) };
        }
    }
}
