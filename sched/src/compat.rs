// =============================================================================
// UniOS — BSD-style sleep/wakeup channels
// =============================================================================
//
// The classic kernel interface: a thread sleeps "on" an arbitrary
// address-like token, and wakeup(token) rouses everyone sleeping there.
// Each live channel is a mutex-plus-waitqueue pair kept in a registry
// owned by the kernel context; channels are created on first sleep and
// garbage-collected when the last reference goes away.
// =============================================================================

use core::time::Duration;
use std::sync::Arc;

use crate::kernel;
use crate::sched::timer::Timer;
use crate::sync::waitqueue::{wait_for_interruptible, WaitQueue};
use crate::sync::RawMutex;

/// Why an [`msleep`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepResult {
    /// A `wakeup` on the channel reached us.
    Woken,
    /// The timeout elapsed first.
    Timeout,
    /// The sleeping thread was interrupted.
    Interrupted,
}

/// One wait channel. Held by the registry and by every thread currently
/// touching it; the registry entry is dropped when nobody else is.
pub(crate) struct Channel {
    mtx: RawMutex,
    wq: WaitQueue,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mtx: RawMutex::new(),
            wq: WaitQueue::new(),
        })
    }
}

fn channel(chan: usize) -> Arc<Channel> {
    kernel::get()
        .compat_channels
        .lock()
        .entry(chan)
        .or_insert_with(Channel::new)
        .clone()
}

fn lookup(chan: usize) -> Option<Arc<Channel>> {
    kernel::get().compat_channels.lock().get(&chan).cloned()
}

/// Drop the registry entry if no thread holds the channel any more.
fn collect(chan: usize) {
    let mut map = kernel::get().compat_channels.lock();
    if let Some(ch) = map.get(&chan) {
        // Sole reference is the registry's own: no sleeper (each keeps a
        // clone on its stack) and no waker mid-flight.
        if Arc::strong_count(ch) == 1 {
            map.remove(&chan);
        }
    }
}

/// Sleep on channel `chan` until woken, interrupted, or `timeout` (if
/// any) elapses.
pub fn msleep(chan: usize, timeout: Option<Duration>) -> SleepResult {
    let ch = channel(chan);
    let timer = Timer::new();
    if let Some(d) = timeout {
        timer.set(d);
    }
    ch.mtx.lock();
    let waiter = ch.wq.waiter();
    let result = if timeout.is_some() {
        wait_for_interruptible(&ch.mtx, &[&waiter, &timer])
    } else {
        wait_for_interruptible(&ch.mtx, &[&waiter])
    };
    ch.mtx.unlock();
    let woken = waiter.woken();
    drop(waiter);
    drop(ch);
    collect(chan);
    if woken {
        SleepResult::Woken
    } else if result.is_err() {
        SleepResult::Interrupted
    } else {
        SleepResult::Timeout
    }
}

/// Wake every thread sleeping on `chan`.
pub fn wakeup(chan: usize) {
    if let Some(ch) = lookup(chan) {
        ch.mtx.lock();
        ch.wq.wake_all(&ch.mtx);
        ch.mtx.unlock();
        drop(ch);
        collect(chan);
    }
}

/// Wake the longest-sleeping thread on `chan`, if any.
pub fn wakeup_one(chan: usize) {
    if let Some(ch) = lookup(chan) {
        ch.mtx.lock();
        ch.wq.wake_one(&ch.mtx);
        ch.mtx.unlock();
        drop(ch);
        collect(chan);
    }
}
