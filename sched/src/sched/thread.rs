// =============================================================================
// UniOS — Kernel Threads
// =============================================================================
//
// A kernel thread is a schedulable unit backed by a parked host thread.
// The scheduler chooses which thread each virtual CPU runs; everyone else
// is parked. A thread's `status` word drives every scheduling decision:
//
//            wake
//  unstarted ----> queued <---------------------+
//                    |                          |
//           dispatch |                     wake | (queue on a cpu)
//                    v        prepare_wait      |
//    +---------> running -------------> waiting | --+
//    |               |                      |   |   | wake_lock
//    |               | exit        timeout/ |   |   | (wait morphing)
//    |               v             wake     v   |   v
//    |          terminating                waking  sending_lock
//    |               |                                  |
//    |               v                                  | mutex hand-off
//    |          terminated                              |
//    +--------------------------------------------------+
//
// Status is written by the owning thread for running->waiting and the
// terminal states; wakers move waiting->waking with a CAS and commit the
// wakeup under the target CPU's run-queue lock. `waking` and
// `sending_lock` are transitional: a thread in `waking` is owned by the
// waker until it lands in a run queue, and a thread in `sending_lock` is
// owned by the mutex it is being handed.
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use super::{clock, preempt_count, WaitLock};
use crate::config::{self, WEIGHT_UNIT};
use crate::kernel;
use crate::sched::Interrupted;

// ── Thread identifiers ──────────────────────────────────────────

/// Monotonically increasing thread id counter. Id 0 is reserved to mean
/// "no thread" (e.g. an unowned mutex).
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> u64 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Home-CPU value for threads that have none (adopted host threads).
pub(crate) const CPU_NONE: u32 = u32::MAX;

/// Thread names are capped at 15 bytes, like the kernel they came from.
const NAME_MAX: usize = 15;

fn clip_name(mut name: String) -> String {
    if name.len() > NAME_MAX {
        let mut end = NAME_MAX;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

// ── Status ──────────────────────────────────────────────────────

/// The scheduling states a thread moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Created but not yet started.
    Unstarted = 0,
    /// In some CPU's run queue.
    Queued = 1,
    /// Selected by a CPU; its host thread is the one executing.
    Running = 2,
    /// Announced intent to sleep; wakeable.
    Waiting = 3,
    /// A waker owns the thread and is queueing it on a CPU.
    Waking = 4,
    /// A mutex owns the thread and will wake it with the lock held.
    SendingLock = 5,
    /// Running its exit path; no longer wakeable.
    Terminating = 6,
    /// Done. Joiners may reap it.
    Terminated = 7,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Unstarted,
            1 => Status::Queued,
            2 => Status::Running,
            3 => Status::Waiting,
            4 => Status::Waking,
            5 => Status::SendingLock,
            6 => Status::Terminating,
            7 => Status::Terminated,
            _ => unreachable!("corrupt thread status {v}"),
        }
    }
}

bitflags! {
    /// Sets of states a wakeup is allowed to act on. A plain wake only
    /// touches `WAITING`; the mutex hand-off also claims threads parked in
    /// `SENDING_LOCK`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct StatusMask: u8 {
        const UNSTARTED    = 1 << 0;
        const QUEUED       = 1 << 1;
        const RUNNING      = 1 << 2;
        const WAITING      = 1 << 3;
        const WAKING       = 1 << 4;
        const SENDING_LOCK = 1 << 5;
        const TERMINATING  = 1 << 6;
        const TERMINATED   = 1 << 7;
    }
}

fn mask_of(s: Status) -> StatusMask {
    StatusMask::from_bits_truncate(1 << s as u8)
}

// ── Detach state ────────────────────────────────────────────────

// Three-way handshake between exit and detach: whichever side finishes
// second is responsible for reaping.
const ATTACHED: u8 = 0;
const DETACHED: u8 = 1;
const ATTACHED_COMPLETE: u8 = 2;

// ── Scheduling class ────────────────────────────────────────────

/// Parameters for a real-time thread.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RtParams {
    pub(crate) priority: u32,
    pub(crate) slice_nanos: u64,
}

// ── Creation attributes ─────────────────────────────────────────

/// Thread creation attributes, chainable:
/// ```ignore
/// Thread::make(body, Attr::new().name("flusher").pin(0).detached())
/// ```
#[derive(Clone, Default)]
pub struct Attr {
    name: Option<String>,
    stack: Option<usize>,
    pin: Option<u32>,
    detached: bool,
    rt_priority: Option<u32>,
    rt_slice: Option<Duration>,
    weight: Option<u32>,
}

impl Attr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack(mut self, bytes: usize) -> Self {
        self.stack = Some(bytes);
        self
    }

    /// Restrict the thread to a single CPU for its whole life.
    pub fn pin(mut self, cpu: usize) -> Self {
        self.pin = Some(cpu as u32);
        self
    }

    /// The thread reaps itself on exit; it must never be joined.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Schedule in the real-time class. Higher priority always runs first;
    /// equal priorities round-robin on the configured time slice.
    pub fn realtime(mut self, priority: u32) -> Self {
        self.rt_priority = Some(priority);
        self
    }

    /// Override the real-time round-robin slice.
    pub fn realtime_slice(mut self, slice: Duration) -> Self {
        self.rt_slice = Some(slice);
        self
    }

    /// Fair-class weight in units of [`WEIGHT_UNIT`] (1024 == 1.0).
    /// A weight-2048 thread receives twice the CPU share of a default one.
    pub fn weight(mut self, weight: u32) -> Self {
        assert!(weight > 0, "weight must be positive");
        self.weight = Some(weight);
        self
    }
}

// ── Statistics ──────────────────────────────────────────────────

#[derive(Default)]
struct Stats {
    switches: AtomicU64,
    preemptions: AtomicU64,
    migrations: AtomicU64,
}

/// A point-in-time snapshot of a thread's scheduling counters.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStats {
    /// Times the thread was dispatched onto a CPU.
    pub switches: u64,
    /// Involuntary context switches.
    pub preemptions: u64,
    /// Times the thread changed CPUs.
    pub migrations: u64,
    /// Total CPU time consumed.
    pub cpu_time: Duration,
}

// ── The thread itself ───────────────────────────────────────────

/// A kernel thread. Shared by `Arc`: the run queues, wakers, joiners and
/// the thread's own host closure each hold a handle, so a thread record
/// can never be freed out from under a late waker.
pub struct Thread {
    id: u64,
    name: String,
    status: AtomicU8,

    // Scheduling class; immutable after make() except the fair weight.
    realtime: Option<RtParams>,
    weight: AtomicU32,
    pinned: AtomicBool,
    adopted: bool,
    stack_size: usize,

    // Bookkeeping mutated under the owning CPU's run-queue lock, stored
    // atomically because wakers on other CPUs read it.
    vruntime: AtomicU64,
    queue_seq: AtomicU64,
    cpu: AtomicU32,
    running_since: AtomicU64,
    total_cpu: AtomicU64,

    // Wake/wait protocol.
    interrupted: AtomicBool,
    lock_sent: AtomicBool,
    host: SpinMutex<Option<std::thread::Thread>>,

    // Lifecycle.
    detach_state: AtomicU8,
    joiner: SpinMutex<Option<Arc<Thread>>>,
    entry: SpinMutex<Option<Box<dyn FnOnce() + Send>>>,

    stats: Stats,
}

impl Thread {
    // ── Construction and lifecycle ──────────────────────────────

    /// Create a thread that will run `entry` once started.
    ///
    /// The thread does not run (and has no host thread) until
    /// [`start`](Self::start) is called.
    pub fn make(entry: impl FnOnce() + Send + 'static, attr: Attr) -> Arc<Thread> {
        let k = kernel::get();
        let id = alloc_tid();
        let rt = attr.rt_priority.map(|priority| RtParams {
            priority,
            slice_nanos: attr
                .rt_slice
                .unwrap_or(k.config().default_rt_slice)
                .as_nanos() as u64,
        });
        if let Some(cpu) = attr.pin {
            assert!(
                (cpu as usize) < k.num_cpus(),
                "pinned to nonexistent cpu {cpu}"
            );
        }
        let t = Arc::new(Thread {
            id,
            name: clip_name(attr.name.unwrap_or_else(|| format!("thread-{id}"))),
            status: AtomicU8::new(Status::Unstarted as u8),
            realtime: rt,
            weight: AtomicU32::new(attr.weight.unwrap_or(WEIGHT_UNIT)),
            pinned: AtomicBool::new(attr.pin.is_some()),
            adopted: false,
            stack_size: attr.stack.unwrap_or(k.config().default_stack),
            vruntime: AtomicU64::new(0),
            queue_seq: AtomicU64::new(u64::MAX),
            cpu: AtomicU32::new(attr.pin.unwrap_or(0)),
            running_since: AtomicU64::new(0),
            total_cpu: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            lock_sent: AtomicBool::new(false),
            host: SpinMutex::new(None),
            detach_state: AtomicU8::new(if attr.detached { DETACHED } else { ATTACHED }),
            joiner: SpinMutex::new(None),
            entry: SpinMutex::new(Some(Box::new(entry))),
            stats: Stats::default(),
        });
        k.register_thread(&t);
        log::trace!("made thread {} '{}'", t.id, t.name);
        t
    }

    /// [`make`](Self::make) followed by [`start`](Self::start).
    pub fn spawn(entry: impl FnOnce() + Send + 'static, attr: Attr) -> Arc<Thread> {
        let t = Thread::make(entry, attr);
        t.start();
        t
    }

    /// Start a thread made with [`make`](Self::make). Panics if called
    /// twice.
    pub fn start(self: &Arc<Self>) {
        let prev = self.status.compare_exchange(
            Status::Unstarted as u8,
            Status::Waking as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(prev.is_ok(), "thread '{}' started twice", self.name);

        let me = self.clone();
        std::thread::Builder::new()
            .name(self.name.clone())
            .stack_size(self.stack_size)
            .spawn(move || host_main(me))
            .expect("out of memory: cannot allocate thread stack");

        let k = kernel::get();
        let cpu = if self.is_pinned() {
            self.cpu_id()
        } else {
            k.least_loaded_cpu(None)
        };
        self.cpu.store(cpu, Ordering::Relaxed);
        k.cpu(cpu).admit(self.clone());
    }

    /// Wait for the thread to terminate.
    ///
    /// Panics if the thread is detached or joins itself. Join cycles
    /// through more than one thread are not detected and hang.
    pub fn join(self: &Arc<Self>) {
        assert!(
            self.detach_state.load(Ordering::Acquire) != DETACHED,
            "cannot join detached thread '{}'",
            self.name
        );
        let joiner = current();
        assert!(
            joiner.id() != self.id,
            "thread '{}' cannot join itself",
            self.name
        );
        *self.joiner.lock() = Some(joiner);
        super::wait_until(|| self.status() == Status::Terminated);
        kernel::get().unregister_thread(self.id);
    }

    /// Give up the right to join the thread; it will reap itself on exit.
    pub fn detach(self: &Arc<Self>) {
        match self.detach_state.compare_exchange(
            ATTACHED,
            DETACHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(ATTACHED_COMPLETE) => {
                // Already exited; reaping is now on us.
                kernel::get().reap(self.clone());
            }
            Err(_) => panic!("thread '{}' detached twice", self.name),
        }
    }

    // ── Waking ──────────────────────────────────────────────────

    /// Wake the thread if it is waiting. Returns false if it was in any
    /// other state (the wake is then a no-op, not an error).
    pub fn wake(self: &Arc<Self>) -> bool {
        self.wake_impl(StatusMask::WAITING)
    }

    /// Run `action` and then wake the thread, while holding a strong
    /// handle across both.
    ///
    /// This is the race-free way to publish a condition and wake its
    /// waiter when the waiter might exit and be dropped the moment the
    /// condition becomes visible: the handle keeps the record alive until
    /// the wake has finished with it.
    pub fn wake_with(self: &Arc<Self>, action: impl FnOnce()) -> bool {
        let holder = self.clone();
        action();
        holder.wake_impl(StatusMask::WAITING)
    }

    /// Interrupt the thread's current (and next) interruptible wait.
    pub fn interrupt(self: &Arc<Self>) {
        self.interrupted.store(true, Ordering::Release);
        self.wake_impl(StatusMask::WAITING);
    }

    /// True if an interrupt is pending and not yet consumed by a wait.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Move the thread out of a wakeable state and queue it on a CPU.
    pub(crate) fn wake_impl(self: &Arc<Self>, allowed: StatusMask) -> bool {
        loop {
            let cur = self.status();
            if !allowed.contains(mask_of(cur)) {
                return false;
            }
            if self
                .status
                .compare_exchange_weak(
                    cur as u8,
                    Status::Waking as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        if self.adopted {
            // No CPU involved: the host thread parks directly.
            self.set_status(Status::Running);
            self.unpark();
            return true;
        }
        let k = kernel::get();
        // The thread may still be executing on its home CPU, between
        // announcing the sleep and dispatching away. Until that CPU's
        // run-queue lock says it has vacated, it must not be queued
        // anywhere else: two CPUs would both name it current.
        if k.cpu(self.cpu_id()).try_cancel_sleep(self) {
            super::preempt_point();
            return true;
        }
        let cpu = self.pick_wake_cpu(k);
        k.cpu(cpu).admit(self.clone());
        super::preempt_point();
        true
    }

    fn pick_wake_cpu(&self, k: &kernel::Kernel) -> u32 {
        let home = self.cpu.load(Ordering::Relaxed);
        if self.is_pinned() {
            return home;
        }
        let chosen = k.least_loaded_cpu(Some(home));
        if chosen != home && home != CPU_NONE {
            self.stats.migrations.fetch_add(1, Ordering::Relaxed);
        }
        chosen
    }

    // ── Waiting (thread side) ───────────────────────────────────

    /// Announce intent to sleep: running -> waiting. Between this call and
    /// [`wait`](Self::wait) the thread must re-check its wake condition;
    /// a waker may act at any point after this.
    pub(crate) fn prepare_wait(&self) {
        assert_eq!(
            preempt_count(),
            0,
            "thread '{}' blocked with preemption disabled",
            self.name
        );
        debug_assert_eq!(self.status(), Status::Running);
        self.status.store(Status::Waiting as u8, Ordering::Release);
    }

    /// Retract intent to sleep, waiting out any waker that has already
    /// claimed us.
    pub(crate) fn stop_wait(&self) {
        loop {
            match self.status() {
                Status::Running => return,
                Status::Waiting => {
                    if self
                        .status
                        .compare_exchange(
                            Status::Waiting as u8,
                            Status::Running as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                // A waker or a mutex owns us for a moment; it will set
                // Running (possibly via a full sleep-and-handoff).
                Status::Waking | Status::SendingLock => core::hint::spin_loop(),
                s => unreachable!("stop_wait in state {s:?}"),
            }
        }
    }

    /// Sleep until a waker makes us runnable again. Must follow
    /// [`prepare_wait`](Self::prepare_wait); returns with status Running.
    pub(crate) fn wait(self: &Arc<Self>) {
        if self.adopted {
            while self.status() != Status::Running {
                std::thread::park();
            }
            return;
        }
        let k = kernel::get();
        loop {
            match self.status() {
                Status::Running => return,
                // A waker is mid-flight; it will either queue us somewhere
                // or cancel the sleep in place.
                Status::Waking => core::hint::spin_loop(),
                Status::Waiting | Status::SendingLock => {
                    let cpu = k.cpu(self.cpu_id());
                    if cpu.block_current(self) {
                        self.park_until_running();
                        return;
                    }
                    // Status changed under us; decide again.
                }
                s => unreachable!("wait() in state {s:?}"),
            }
        }
    }

    pub(crate) fn park_until_running(&self) {
        while self.status() != Status::Running {
            std::thread::park();
        }
    }

    // ── Wait morphing hooks ─────────────────────────────────────

    /// Claim a waiting thread for a mutex hand-off (waiting ->
    /// sending_lock). Fails if the thread is not currently waiting.
    pub(crate) fn begin_send_lock(&self) -> bool {
        self.status
            .compare_exchange(
                Status::Waiting as u8,
                Status::SendingLock as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Back out of a hand-off claim, making the thread plainly wakeable
    /// again. The claim may already be resolved by a concurrent mutex
    /// hand-off, in which case the thread is being woken with the lock
    /// and there is nothing to undo.
    pub(crate) fn end_send_lock(&self) {
        let _ = self.status.compare_exchange(
            Status::SendingLock as u8,
            Status::Waiting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn set_lock_sent(&self) {
        self.lock_sent.store(true, Ordering::Release);
    }

    pub(crate) fn take_lock_sent(&self) -> bool {
        self.lock_sent.swap(false, Ordering::AcqRel)
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> ThreadStats {
        ThreadStats {
            switches: self.stats.switches.load(Ordering::Relaxed),
            preemptions: self.stats.preemptions.load(Ordering::Relaxed),
            migrations: self.stats.migrations.load(Ordering::Relaxed),
            cpu_time: Duration::from_nanos(self.total_cpu.load(Ordering::Relaxed)),
        }
    }

    /// Real-time priority, if the thread is in the real-time class.
    pub fn realtime_priority(&self) -> Option<u32> {
        self.realtime.map(|rt| rt.priority)
    }

    /// Change the fair-class weight. Takes effect at the next accounting
    /// boundary. No effect on real-time threads.
    pub fn set_weight(&self, weight: u32) {
        assert!(weight > 0, "weight must be positive");
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Relaxed);
    }

    pub(crate) fn is_adopted(&self) -> bool {
        self.adopted
    }

    pub(crate) fn cpu_id(&self) -> u32 {
        self.cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub(crate) fn rt_params(&self) -> Option<RtParams> {
        self.realtime
    }

    pub(crate) fn set_status(&self, s: Status) {
        self.status.store(s as u8, Ordering::Release);
    }

    pub(crate) fn unpark(&self) {
        if let Some(h) = self.host.lock().as_ref() {
            h.unpark();
        }
    }

    pub(crate) fn note_migrated(&self) {
        self.stats.migrations.fetch_add(1, Ordering::Relaxed);
    }

    // ── Run-queue bookkeeping (owning CPU's lock held) ──────────

    pub(crate) fn vruntime(&self) -> u64 {
        self.vruntime.load(Ordering::Relaxed)
    }

    pub(crate) fn set_vruntime(&self, v: u64) {
        self.vruntime.store(v, Ordering::Relaxed);
    }

    /// The queue sequence number preserving this thread's FIFO position
    /// among equal-priority real-time threads, or `u64::MAX` if it should
    /// be assigned a fresh (rearmost) one.
    pub(crate) fn queue_seq(&self) -> Option<u64> {
        match self.queue_seq.load(Ordering::Relaxed) {
            u64::MAX => None,
            s => Some(s),
        }
    }

    pub(crate) fn store_queue_seq(&self, seq: u64) {
        self.queue_seq.store(seq, Ordering::Relaxed);
    }

    pub(crate) fn clear_queue_seq(&self) {
        self.queue_seq.store(u64::MAX, Ordering::Relaxed);
    }

    pub(crate) fn running_since_nanos(&self) -> u64 {
        self.running_since.load(Ordering::Relaxed)
    }

    /// Fair-class vruntime the thread would have if accounted at `now`.
    pub(crate) fn projected_vruntime(&self, now: u64) -> u64 {
        let ran = now.saturating_sub(self.running_since_nanos());
        self.vruntime() + Self::scale(ran, self.weight.load(Ordering::Relaxed))
    }

    fn scale(delta: u64, weight: u32) -> u64 {
        delta.saturating_mul(WEIGHT_UNIT as u64) / (weight.max(1) as u64)
    }

    /// Charge the thread for the CPU time since it was dispatched.
    pub(crate) fn account(&self, now: u64, queue: &mut super::runqueue::RunQueue) {
        let delta = now.saturating_sub(self.running_since_nanos());
        self.total_cpu.fetch_add(delta, Ordering::Relaxed);
        if self.realtime.is_none() {
            let dv = Self::scale(delta, self.weight.load(Ordering::Relaxed));
            let v = self.vruntime.fetch_add(dv, Ordering::Relaxed) + dv;
            queue.note_min(v);
        }
        self.running_since.store(now, Ordering::Relaxed);
    }

    pub(crate) fn note_dispatched(&self, now: u64) {
        self.running_since.store(now, Ordering::Relaxed);
        self.stats.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_preempted(&self) {
        self.stats.preemptions.fetch_add(1, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

// ── Host-thread entry and exit ──────────────────────────────────

fn host_main(me: Arc<Thread>) {
    *me.host.lock() = Some(std::thread::current());
    CURRENT.with(|c| *c.borrow_mut() = Some(me.clone()));
    me.park_until_running();

    let entry = me.entry.lock().take();
    if let Some(f) = entry {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
            log::error!("kernel thread '{}' panicked", me.name());
        }
    }
    complete(me);
}

/// Thread exit path: notifiers, final context switch, reap handshake.
fn complete(me: Arc<Thread>) {
    let k = kernel::get();
    k.run_exit_notifiers();
    me.set_status(Status::Terminating);

    // Leave the CPU for the last time. We keep executing host-side for a
    // few more instructions, but we no longer touch any CPU's dispatch
    // state and nothing below can block.
    k.cpu(me.cpu_id()).retire_current(&me);

    me.set_status(Status::Terminated);
    log::trace!("thread {} '{}' terminated", me.id(), me.name());

    match me.detach_state.compare_exchange(
        ATTACHED,
        ATTACHED_COMPLETE,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            // Attached: the joiner (if any yet) reaps us.
            if let Some(j) = me.joiner.lock().take() {
                j.wake();
            }
        }
        Err(_) => {
            // Detached: hand ourselves to the reaper.
            k.reap(me.clone());
        }
    }
}

// ── Current thread ──────────────────────────────────────────────

std::thread_local! {
    static CURRENT: core::cell::RefCell<Option<Arc<Thread>>> =
        const { core::cell::RefCell::new(None) };
}

pub(crate) fn try_current() -> Option<Arc<Thread>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn current() -> Arc<Thread> {
    if let Some(t) = try_current() {
        return t;
    }
    adopt()
}

/// Give a foreign host thread (e.g. a test harness main thread) a thread
/// record so it can use mutexes, wait queues and timers. Adopted threads
/// have no home CPU: they block by parking and are woken by unparking.
fn adopt() -> Arc<Thread> {
    let k = kernel::get();
    let id = alloc_tid();
    let host = std::thread::current();
    let name = clip_name(
        host.name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("adopted-{id}")),
    );
    let t = Arc::new(Thread {
        id,
        name,
        status: AtomicU8::new(Status::Running as u8),
        realtime: None,
        weight: AtomicU32::new(WEIGHT_UNIT),
        pinned: AtomicBool::new(false),
        adopted: true,
        stack_size: config::DEFAULT_STACK_SIZE,
        vruntime: AtomicU64::new(0),
        queue_seq: AtomicU64::new(u64::MAX),
        cpu: AtomicU32::new(CPU_NONE),
        running_since: AtomicU64::new(clock::uptime_nanos()),
        total_cpu: AtomicU64::new(0),
        interrupted: AtomicBool::new(false),
        lock_sent: AtomicBool::new(false),
        host: SpinMutex::new(Some(host)),
        detach_state: AtomicU8::new(DETACHED),
        joiner: SpinMutex::new(None),
        entry: SpinMutex::new(None),
        stats: Stats::default(),
    });
    k.register_thread(&t);
    CURRENT.with(|c| *c.borrow_mut() = Some(t.clone()));
    log::trace!("adopted host thread as {} '{}'", t.id(), t.name());
    t
}

// ── The wait loop ───────────────────────────────────────────────

/// The common sleep loop behind every form of `wait_until`.
///
/// The associated lock (if any) is held on entry, released across each
/// sleep, and held again on return — either by normal re-acquisition or
/// because a waker morphed us onto the mutex's wait queue and handed it
/// over.
pub(crate) fn do_wait_until<const INTERRUPTIBLE: bool, L, P>(
    lock: &L,
    mut pred: P,
) -> Result<(), Interrupted>
where
    L: WaitLock,
    P: FnMut() -> bool,
{
    let me = current();
    loop {
        me.prepare_wait();
        if pred() {
            break;
        }
        if INTERRUPTIBLE && me.take_interrupted() {
            me.stop_wait();
            return Err(Interrupted);
        }
        lock.release();
        me.wait();
        me.stop_wait();
        lock.reacquire(&me);
    }
    me.stop_wait();
    Ok(())
}
