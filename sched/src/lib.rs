// =============================================================================
// UniOS — Scheduler and Synchronization Core
// =============================================================================
//
// This crate multiplexes kernel threads over a set of virtual CPUs and
// provides the sleeping synchronization primitives everything else in the
// system is built on.
//
// ARCHITECTURE:
//   - Each virtual CPU owns a run queue (fair + real-time class) and runs
//     exactly one thread at a time. Each kernel thread is backed by a host
//     thread that executes only while its CPU has selected it; blocking
//     dispatches a successor and parks the host thread.
//   - The mutex is lock-free in the sense that lockers and unlockers never
//     spin on each other: contended unlocks hand the lock directly to a
//     queued waiter, and a waiter that races with an unlock picks up a
//     hand-off token instead of sleeping forever.
//   - Wait queues morph their wakeups: a thread woken while the waker holds
//     the associated mutex is moved onto the mutex's wait queue and handed
//     the lock, instead of being woken just to contend for it.
//   - RCU readers are preemption-disabled critical sections; writers retire
//     old values through a reclaimer thread that waits for every CPU to
//     pass through the scheduler.
//
// PREEMPTION MODEL:
//   Preemption is cooperative at the host level: the clock driver marks a
//   CPU as due for rescheduling and the mark is honored at scheduler entry
//   points (lock slow paths, unlock, wake, yield) and at explicit
//   `sched::preempt_point()` calls. Compute loops that never touch a
//   scheduler entry point must call `preempt_point()` themselves.
// =============================================================================

pub mod compat;
pub mod config;
pub mod kernel;
pub mod percpu;
pub mod sched;
pub mod sync;

pub use config::Config;
pub use sched::thread::{Attr, Thread, ThreadStats};
pub use sched::timer::Timer;
pub use sched::{
    current, preempt_point, sleep, sleep_interruptible, wait_until, wait_until_interruptible,
    yield_now, Interrupted,
};
pub use sync::mutex::{Mutex, MutexGuard, RawMutex};
pub use sync::rcu::{self, RcuPtr};
pub use sync::waitqueue::{wait_for, wait_for_interruptible, Condvar, WaitQueue, Waitable};
