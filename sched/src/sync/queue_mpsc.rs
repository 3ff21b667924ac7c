// =============================================================================
// UniOS — Lock-Free Multi-Producer Single-Consumer Queue
// =============================================================================
//
// An intrusive MPSC queue of items linked through a pointer they carry
// themselves. Any number of threads may push concurrently; exactly one
// consumer at a time may pop.
//
// HOW IT WORKS:
//   - `pushlist` is a LIFO stack that producers prepend to with a CAS loop.
//   - `poplist` is a private FIFO the consumer pops from.
//   - When the pop list runs dry, the consumer grabs the entire push list
//     in one atomic swap and reverses it into the pop list. Reversal turns
//     the LIFO stack into oldest-first order, so the queue as a whole is
//     FIFO per producer.
//
// WHY NOT A LOCK:
//   This queue sits inside the mutex implementation — it records who is
//   waiting for a mutex, so it cannot itself take one. Pushes are a single
//   CAS; the consumer never blocks producers.
//
// OWNERSHIP:
//   Items are borrowed, not owned: the caller guarantees each pushed item
//   stays alive until the consumer has popped it and finished with it.
// =============================================================================

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// An item that can be linked into a [`QueueMpsc`].
pub(crate) trait Node: Sized {
    /// The intrusive link. Owned by the queue while the item is enqueued.
    fn next_link(&self) -> &AtomicPtr<Self>;
}

pub(crate) struct QueueMpsc<T: Node> {
    /// Incoming items, newest first. Shared by all producers.
    pushlist: AtomicPtr<T>,
    /// Consumer-private list, oldest first.
    poplist: AtomicPtr<T>,
}

// SAFETY: the queue stores raw pointers to items whose liveness the callers
// guarantee; the atomics make the link manipulation itself thread-safe.
unsafe impl<T: Node + Send> Send for QueueMpsc<T> {}
unsafe impl<T: Node + Send> Sync for QueueMpsc<T> {}

impl<T: Node> QueueMpsc<T> {
    pub(crate) const fn new() -> Self {
        Self {
            pushlist: AtomicPtr::new(ptr::null_mut()),
            poplist: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Add an item to the queue. Safe to call from any number of threads
    /// concurrently with each other and with one `pop()`.
    ///
    /// # Safety
    /// `item` must point to a live node that remains valid until a consumer
    /// pops it and is done with it.
    pub(crate) unsafe fn push(&self, item: *mut T) {
        let mut old = self.pushlist.load(Ordering::Relaxed);
        loop {
            (*item).next_link().store(old, Ordering::Relaxed);
            match self
                .pushlist
                .compare_exchange_weak(old, item, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    /// Remove the oldest item, or return null if the queue is empty.
    ///
    /// # Safety
    /// Single consumer: no two `pop()` calls may race with each other.
    pub(crate) unsafe fn pop(&self) -> *mut T {
        let head = self.poplist.load(Ordering::Relaxed);
        if !head.is_null() {
            self.poplist
                .store((*head).next_link().load(Ordering::Relaxed), Ordering::Relaxed);
            return head;
        }
        // Pop list empty — take everything producers have pushed so far.
        let mut chain = self.pushlist.swap(ptr::null_mut(), Ordering::Acquire);
        if chain.is_null() {
            return ptr::null_mut();
        }
        // Reverse the newest-first chain into oldest-first order.
        let mut prev = ptr::null_mut();
        while !chain.is_null() {
            let next = (*chain).next_link().load(Ordering::Relaxed);
            (*chain).next_link().store(prev, Ordering::Relaxed);
            prev = chain;
            chain = next;
        }
        // `prev` is now the oldest item; the rest become the pop list.
        self.poplist
            .store((*prev).next_link().load(Ordering::Relaxed), Ordering::Relaxed);
        prev
    }

    /// Scan for an item matching `pred`, popping nothing.
    ///
    /// # Safety
    /// The consumer must be quiescent for the duration: no `pop()` may
    /// run concurrently, so linked nodes stay linked and alive. Pushes
    /// may race with the scan and may or may not be observed.
    pub(crate) unsafe fn any(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        for head in [
            self.poplist.load(Ordering::Acquire),
            self.pushlist.load(Ordering::Acquire),
        ] {
            let mut cur = head;
            while !cur.is_null() {
                if pred(&*cur) {
                    return true;
                }
                cur = (*cur).next_link().load(Ordering::Acquire);
            }
        }
        false
    }

    /// True if no item is currently enqueued.
    ///
    /// Like every emptiness check on a concurrent queue, the answer may be
    /// stale by the time the caller acts on it; the mutex hand-off protocol
    /// is built to tolerate that.
    pub(crate) fn is_empty(&self) -> bool {
        self.poplist.load(Ordering::Relaxed).is_null()
            && self.pushlist.load(Ordering::Acquire).is_null()
    }
}
