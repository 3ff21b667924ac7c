// =============================================================================
// UniOS — Read-Copy-Update
// =============================================================================
//
// Readers are nearly free: entering a read-side section disables
// preemption, and a grace period is over once every CPU has passed
// through the scheduler (or is idle). Writers swap the pointer, then
// retire the old value; retired values are reclaimed by a dedicated
// kernel thread after a grace period, in batches.
//
// Threads not running on a virtual CPU (adopted host threads) cannot be
// tracked through scheduler passes, so they are counted explicitly in
// `external_readers` instead.
// =============================================================================

use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};
use core::time::Duration;

use crate::kernel::{self, Kernel};
use crate::sched::{self, thread};

// ── Read-side critical sections ─────────────────────────────────

/// Proof of being inside a read-side critical section.
///
/// While a guard is live, no pointer read through it is reclaimed.
/// Sleeping while holding one is forbidden (and asserted by the
/// scheduler, since preemption is disabled).
pub struct RcuReadGuard {
    external: bool,
    // !Send: the preempt count is per host thread.
    _marker: PhantomData<*const ()>,
}

/// Enter a read-side critical section.
pub fn read_lock() -> RcuReadGuard {
    let external = match thread::try_current() {
        Some(t) if !t.is_adopted() => {
            sched::preempt_disable();
            false
        }
        _ => {
            kernel::get()
                .rcu
                .external_readers
                .fetch_add(1, Ordering::AcqRel);
            true
        }
    };
    RcuReadGuard {
        external,
        _marker: PhantomData,
    }
}

impl Drop for RcuReadGuard {
    fn drop(&mut self) {
        if self.external {
            kernel::get()
                .rcu
                .external_readers
                .fetch_sub(1, Ordering::AcqRel);
        } else {
            sched::preempt_enable();
        }
    }
}

// ── The protected pointer ───────────────────────────────────────

/// An atomically replaceable, RCU-protected heap value.
pub struct RcuPtr<T> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: Send + Sync> Send for RcuPtr<T> {}
unsafe impl<T: Send + Sync> Sync for RcuPtr<T> {}

impl<T> RcuPtr<T> {
    pub const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn new(value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
        }
    }

    /// Dereference under a read-side guard. The reference is valid for
    /// the guard's lifetime even if a writer replaces the pointer.
    pub fn read<'g>(&self, _guard: &'g RcuReadGuard) -> Option<&'g T> {
        // SAFETY: a non-null pointer seen under the guard is not freed
        // until after the guard drops; see `synchronize`.
        unsafe { self.ptr.load(Ordering::Acquire).as_ref() }
    }

    /// Publish a new value; the old one (if any) must be disposed.
    pub fn assign(&self, value: T) -> Retired<T> {
        let fresh = Box::into_raw(Box::new(value));
        Retired(self.ptr.swap(fresh, Ordering::AcqRel))
    }

    /// Clear the pointer; the old value (if any) must be disposed.
    pub fn clear(&self) -> Retired<T> {
        Retired(self.ptr.swap(core::ptr::null_mut(), Ordering::AcqRel))
    }

    /// Take the value out directly. `&mut self` proves there are no
    /// concurrent readers, so no grace period is needed.
    pub fn take(&mut self) -> Option<Box<T>> {
        let p = self.ptr.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(p) })
        }
    }
}

impl<T> Drop for RcuPtr<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// A value unlinked from an [`RcuPtr`], awaiting reclamation.
///
/// Call [`dispose`](Retired::dispose) to free it after a grace period.
/// Dropping a `Retired` without disposing leaks the value.
#[must_use = "retired values must be disposed or they leak"]
pub struct Retired<T>(*mut T);

unsafe impl<T: Send> Send for Retired<T> {}

impl<T: Send + 'static> Retired<T> {
    /// Hand the value to the reclaimer; it is dropped after all current
    /// readers are done. Never blocks.
    pub fn dispose(self) {
        if self.0.is_null() {
            return;
        }
        let p = SendPtr(self.0);
        defer(move || {
            // Rebind so the closure captures the whole wrapper; capturing
            // the `p.0` field alone would capture a bare `*mut T`, which
            // is not Send.
            let p = p;
            unsafe { drop(Box::from_raw(p.0)) }
        });
    }

    /// Wait for a grace period and drop the value in place.
    pub fn dispose_sync(self) {
        if self.0.is_null() {
            return;
        }
        synchronize();
        unsafe { drop(Box::from_raw(self.0)) };
    }
}

struct SendPtr<T>(*mut T);
unsafe impl<T: Send> Send for SendPtr<T> {}

// ── Deferral and grace periods ──────────────────────────────────

/// Run `f` after the current grace period, on the reclaimer thread.
pub fn defer(f: impl FnOnce() + Send + 'static) {
    let k = kernel::get();
    {
        let mut q = k.rcu.queue.lock();
        q.push(Box::new(f));
        // Counted under the lock so done_seq accounting lines up with
        // batch boundaries.
        k.rcu.enqueue_seq.fetch_add(1, Ordering::Release);
    }
    k.wake_reclaimer();
}

/// Block until every read-side section that was live on entry has ended.
///
/// Must not be called with preemption disabled (from inside a read-side
/// section): it would wait for itself.
pub fn synchronize() {
    let k = kernel::get();
    assert_eq!(
        sched::preempt_count(),
        0,
        "rcu synchronize inside a read-side section"
    );
    let baseline: Vec<u64> = k
        .cpus()
        .iter()
        .map(|c| c.quiescent.load(Ordering::Acquire))
        .collect();
    let mut pending: Vec<bool> = vec![true; baseline.len()];
    // Force a scheduler pass everywhere; idle CPUs are already quiescent.
    k.prod_cpus();
    loop {
        let own = match thread::try_current() {
            Some(t) if !t.is_adopted() => t.cpu_id(),
            _ => thread::CPU_NONE,
        };
        let mut remaining = 0;
        for (i, cpu) in k.cpus().iter().enumerate() {
            if !pending[i] {
                continue;
            }
            // Being here, not in a read section, makes our own CPU
            // quiescent by definition.
            if cpu.index == own
                || cpu.is_idle()
                || cpu.quiescent.load(Ordering::Acquire) != baseline[i]
            {
                pending[i] = false;
            } else {
                remaining += 1;
            }
        }
        if remaining == 0 {
            break;
        }
        sched::sleep(Duration::from_micros(200));
    }
    while k.rcu.external_readers.load(Ordering::Acquire) != 0 {
        sched::sleep(Duration::from_micros(200));
    }
}

/// Block until every callback deferred before this call has run.
pub fn flush() {
    let k = kernel::get();
    let target = k.rcu.enqueue_seq.load(Ordering::Acquire);
    k.wake_reclaimer();
    let m = &k.rcu.flush_mutex;
    m.lock();
    while k.rcu.done_seq.load(Ordering::Acquire) < target {
        k.rcu.flush_wq.wait(m);
    }
    m.unlock();
}

/// Main loop of the reclaimer kernel thread.
pub(crate) fn reclaimer_loop(k: &'static Kernel) {
    log::debug!("rcu reclaimer online");
    loop {
        sched::wait_until(|| {
            k.rcu.enqueue_seq.load(Ordering::Acquire) != k.rcu.done_seq.load(Ordering::Acquire)
        });
        let batch = core::mem::take(&mut *k.rcu.queue.lock());
        if batch.is_empty() {
            continue;
        }
        synchronize();
        let n = batch.len() as u64;
        for f in batch {
            f();
        }
        log::trace!("rcu reclaimer ran {} callbacks", n);
        k.rcu.done_seq.fetch_add(n, Ordering::Release);
        let m = &k.rcu.flush_mutex;
        m.lock();
        k.rcu.flush_wq.wake_all(m);
        m.unlock();
    }
}
