// =============================================================================
// UniOS — Virtual CPUs
// =============================================================================
//
// A `Cpu` is a dispatch structure: a run queue, a `current` pointer and a
// `need_resched` flag. Exactly one thread is Running per CPU; everyone
// else on that CPU is Queued or sleeping. The run-queue spinlock is the
// linearization point for every transition into and out of Queued and for
// changes of `current`, which is what makes cross-CPU wakeups race-free:
// a waker that holds the target CPU's lock sees either a current thread
// that has not yet left (and cancels its sleep in place) or a vacated CPU
// it can dispatch onto directly.
//
// LOCKING:
//   The run-queue lock is held for a few dozen instructions and never
//   across a park. Stealing locks the victim's queue and this CPU's queue
//   in sequence, never both at once, so CPUs cannot deadlock stealing
//   from each other.
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use super::clock;
use super::runqueue::RunQueue;
use super::thread::{Status, Thread};
use crate::kernel;

pub(crate) struct Dispatch {
    pub(crate) queue: RunQueue,
    pub(crate) current: Option<Arc<Thread>>,
}

pub(crate) struct Cpu {
    pub(crate) index: u32,
    rq: SpinMutex<Dispatch>,
    need_resched: AtomicBool,
    /// Armed timers on this CPU, keyed by (deadline, timer id).
    pub(crate) timers: SpinMutex<super::timer::TimerList>,
    /// Bumped at every scheduler pass; RCU's grace periods count these.
    pub(crate) quiescent: AtomicU64,
}

impl Cpu {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            rq: SpinMutex::new(Dispatch {
                queue: RunQueue::new(),
                current: None,
            }),
            need_resched: AtomicBool::new(false),
            timers: SpinMutex::new(super::timer::TimerList::new()),
            quiescent: AtomicU64::new(0),
        }
    }

    /// Queued plus running thread count; the load metric for placement.
    pub(crate) fn load(&self) -> usize {
        let d = self.rq.lock();
        d.queue.len() + d.current.is_some() as usize
    }

    pub(crate) fn note_quiescent(&self) {
        self.quiescent.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn take_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.rq.lock().current.is_none()
    }

    // ── Admission ───────────────────────────────────────────────

    /// If `t` is still this CPU's current thread — it announced a sleep
    /// but has not dispatched away yet — cancel the sleep in place.
    /// Returns false once the thread has vacated the CPU; only then may
    /// a waker queue it, here or anywhere else.
    pub(crate) fn try_cancel_sleep(&self, t: &Arc<Thread>) -> bool {
        let d = self.rq.lock();
        match &d.current {
            Some(cur) if cur.id() == t.id() => {
                t.set_status(Status::Running);
                t.unpark();
                true
            }
            _ => false,
        }
    }

    /// Commit a wakeup (or a thread start): the thread is in Waking
    /// state, owned by the caller, and current on no CPU.
    pub(crate) fn admit(&self, t: Arc<Thread>) {
        debug_assert_eq!(t.status(), Status::Waking);
        let mut d = self.rq.lock();
        debug_assert!(!matches!(&d.current, Some(c) if c.id() == t.id()));
        self.place(&mut d, t);
        if d.current.is_none() {
            self.dispatch(&mut d);
        } else if self.should_preempt(&d, clock::uptime_nanos()) {
            self.need_resched.store(true, Ordering::Release);
        }
    }

    /// Insert a thread into the ready queue, applying wake-up placement.
    fn place(&self, d: &mut Dispatch, t: Arc<Thread>) {
        if t.rt_params().is_none() {
            let bonus = kernel::get().config().wake_bonus_nanos();
            let floor = d.queue.min_vruntime().saturating_sub(bonus);
            if t.vruntime() < floor {
                t.set_vruntime(floor);
            }
        }
        t.set_status(Status::Queued);
        t.set_cpu(self.index);
        d.queue.insert(t);
    }

    /// Select and start the next thread. `current` must be vacant; it
    /// stays vacant if the queue is empty (the CPU idles).
    pub(crate) fn dispatch(&self, d: &mut Dispatch) {
        debug_assert!(d.current.is_none());
        self.need_resched.store(false, Ordering::Relaxed);
        self.note_quiescent();
        if let Some(t) = d.queue.pop() {
            t.set_cpu(self.index);
            t.note_dispatched(clock::uptime_nanos());
            d.current = Some(t.clone());
            t.set_status(Status::Running);
            t.unpark();
        }
    }

    // ── Preemption policy ───────────────────────────────────────

    /// Would the best queued thread preempt `current` right now?
    fn should_preempt(&self, d: &Dispatch, now: u64) -> bool {
        let Some(cur) = &d.current else { return false };
        let cfg = kernel::get().config();
        match cur.rt_params() {
            Some(rt) => match d.queue.best_rt_priority() {
                Some(p) if p > rt.priority => true,
                Some(p) if p == rt.priority => {
                    now.saturating_sub(cur.running_since_nanos()) >= rt.slice_nanos
                }
                _ => false,
            },
            None => {
                if d.queue.best_rt_priority().is_some() {
                    return true;
                }
                match d.queue.best_fair_vruntime() {
                    Some(v) => {
                        let ran = now.saturating_sub(cur.running_since_nanos());
                        ran >= cfg.hysteresis_nanos() && cur.projected_vruntime(now) > v
                    }
                    None => false,
                }
            }
        }
    }

    /// Clock-tick hook: raise `need_resched` if the current thread has
    /// outrun its due share. Uses try_lock; a missed tick is fine.
    pub(crate) fn tick(&self, now: u64) {
        if self.need_resched.load(Ordering::Relaxed) {
            return;
        }
        if let Some(d) = self.rq.try_lock() {
            if self.should_preempt(&d, now) {
                self.need_resched.store(true, Ordering::Release);
            }
        }
    }

    // ── Context-switch choreography ─────────────────────────────

    /// Involuntarily switch out `me` (the current thread) if a better
    /// candidate is queued. Called from preemption points.
    pub(crate) fn preempt(&self, me: &Arc<Thread>) {
        let now = clock::uptime_nanos();
        {
            let mut d = self.rq.lock();
            match &d.current {
                Some(cur) if cur.id() == me.id() => {}
                // The request was for a previous tenant of this CPU.
                _ => return,
            }
            // A thread that has announced a sleep is past preempting; its
            // own block path dispatches a successor in a moment.
            if me.status() != Status::Running {
                return;
            }
            if !self.should_preempt(&d, now) {
                return;
            }
            me.account(now, &mut d.queue);
            me.note_preempted();
            // Equal-priority real-time preemption is a slice rotation: the
            // thread goes behind its peers. Preemption by a higher
            // priority (or of a fair thread) keeps its queue position.
            if let Some(rt) = me.rt_params() {
                if d.queue.best_rt_priority() == Some(rt.priority) {
                    me.clear_queue_seq();
                }
            }
            d.current = None;
            self.place(&mut d, me.clone());
            self.dispatch(&mut d);
        }
        me.park_until_running();
    }

    /// Voluntarily requeue `me` behind its peers and run the best thread.
    pub(crate) fn yield_current(&self, me: &Arc<Thread>) {
        let now = clock::uptime_nanos();
        {
            let mut d = self.rq.lock();
            debug_assert!(matches!(&d.current, Some(c) if c.id() == me.id()));
            if d.queue.is_empty() {
                return;
            }
            me.account(now, &mut d.queue);
            if me.rt_params().is_some() {
                me.clear_queue_seq();
            } else if let Some(v) = d.queue.best_fair_vruntime() {
                // Draw level with the head so the FIFO tie-break puts us
                // behind it.
                if me.vruntime() < v {
                    me.set_vruntime(v);
                }
            }
            d.current = None;
            self.place(&mut d, me.clone());
            self.dispatch(&mut d);
        }
        me.park_until_running();
    }

    /// `me` commits to sleeping: verify its wakeable state under the lock,
    /// hand the CPU to a successor and balance if that leaves us idle.
    /// Returns false if a waker got in first (the caller re-decides).
    pub(crate) fn block_current(&self, me: &Arc<Thread>) -> bool {
        let idle;
        {
            let mut d = self.rq.lock();
            if !matches!(me.status(), Status::Waiting | Status::SendingLock) {
                return false;
            }
            debug_assert!(matches!(&d.current, Some(c) if c.id() == me.id()));
            me.account(clock::uptime_nanos(), &mut d.queue);
            d.current = None;
            self.dispatch(&mut d);
            idle = d.current.is_none();
        }
        if idle {
            self.steal();
        }
        true
    }

    /// `me` leaves this CPU for good (thread exit).
    pub(crate) fn retire_current(&self, me: &Arc<Thread>) {
        let idle;
        {
            let mut d = self.rq.lock();
            debug_assert!(matches!(&d.current, Some(c) if c.id() == me.id()));
            me.account(clock::uptime_nanos(), &mut d.queue);
            d.current = None;
            self.dispatch(&mut d);
            idle = d.current.is_none();
        }
        if idle {
            self.steal();
        }
    }

    /// Move the current thread to another CPU (used by pinning).
    pub(crate) fn migrate_current(&self, me: &Arc<Thread>, target: u32) {
        let k = kernel::get();
        {
            let mut d = self.rq.lock();
            debug_assert!(matches!(&d.current, Some(c) if c.id() == me.id()));
            me.account(clock::uptime_nanos(), &mut d.queue);
            d.current = None;
            self.dispatch(&mut d);
        }
        me.note_migrated();
        // Running -> Waking by the thread itself; admit() finishes the move.
        me.set_status(Status::Waking);
        k.cpu(target).admit(me.clone());
        me.park_until_running();
    }

    // ── Load balancing ──────────────────────────────────────────

    /// Called when this CPU goes idle: pull one migratable thread from
    /// the busiest other CPU. Victim and own locks are taken in sequence,
    /// never nested.
    pub(crate) fn steal(&self) {
        let k = kernel::get();
        let mut victim: Option<&Arc<Cpu>> = None;
        let mut most = 0usize;
        for other in k.cpus() {
            if other.index == self.index {
                continue;
            }
            let queued = other.rq.lock().queue.len();
            if queued > most {
                most = queued;
                victim = Some(other);
            }
        }
        let Some(victim) = victim else { return };
        let Some(t) = victim.rq.lock().queue.take_migratable() else {
            return;
        };
        log::trace!(
            "cpu{} stole thread {} '{}' from cpu{}",
            self.index,
            t.id(),
            t.name(),
            victim.index
        );
        t.note_migrated();
        // Through place() so the stolen thread's vruntime is clamped to
        // this queue's floor; its old CPU's clock means nothing here.
        let mut d = self.rq.lock();
        self.place(&mut d, t);
        if d.current.is_none() {
            self.dispatch(&mut d);
        }
    }
}
