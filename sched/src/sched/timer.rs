// =============================================================================
// UniOS — Timers and the Clock Driver
// =============================================================================
//
// A timer is inactive, armed, or expired. Arming inserts it into the
// current CPU's deadline set; the clock driver pops due timers, marks them
// expired and wakes their owners. Firing and cancellation race benignly:
// the state word is the arbiter, and a timer whose armed->expired CAS
// fails was cancelled first and wakes nobody.
//
// The clock driver is a host thread, not a schedulable thread — it is the
// clock-event device of this kernel. Each pass it fires due timers, gives
// every CPU a preemption tick, and sleeps until the earliest deadline or
// one tick, whichever is sooner.
// =============================================================================

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::clock;
use super::thread::{self, Thread, CPU_NONE};
use crate::kernel;
use crate::sync::waitqueue::Waitable;
use crate::sync::RawMutex;

const INACTIVE: u8 = 0;
const ARMED: u8 = 1;
const EXPIRED: u8 = 2;

/// Timer ids; only used to disambiguate equal deadlines in the map key.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerShared {
    id: u64,
    owner: Arc<Thread>,
    state: AtomicU8,
    deadline: AtomicU64,
    /// CPU whose list holds the timer while armed.
    cpu: AtomicU32,
}

/// A one-shot timer owned by the thread that created it.
///
/// The owner arms it with [`set`](Timer::set) and typically sleeps with
/// `wait_until(|| t.expired())` or passes it to
/// [`wait_for`](crate::sync::waitqueue::wait_for). Dropping cancels.
pub struct Timer {
    inner: Arc<TimerShared>,
}

impl Timer {
    /// Create an inactive timer owned by the calling thread.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerShared {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                owner: thread::current(),
                state: AtomicU8::new(INACTIVE),
                deadline: AtomicU64::new(0),
                cpu: AtomicU32::new(0),
            }),
        }
    }

    /// Arm the timer to fire `after` from now. Re-arming an armed or
    /// expired timer resets it.
    pub fn set(&self, after: Duration) {
        self.set_at(clock::uptime() + after);
    }

    /// Arm the timer for an absolute uptime deadline.
    pub fn set_at(&self, deadline: Duration) {
        self.cancel();
        let k = kernel::get();
        let dl = deadline.as_nanos() as u64;
        // Armed timers live on the arming thread's CPU; adopted threads
        // use cpu 0's list (any list serves, the driver scans them all).
        let cpu = match thread::try_current() {
            Some(t) if !t.is_adopted() && t.cpu_id() != CPU_NONE => t.cpu_id(),
            _ => 0,
        };
        self.inner.deadline.store(dl, Ordering::Relaxed);
        self.inner.cpu.store(cpu, Ordering::Relaxed);
        self.inner.state.store(ARMED, Ordering::Release);
        k.cpu(cpu)
            .timers
            .lock()
            .insert(dl, self.inner.id, self.inner.clone());
        k.clock_kick();
    }

    /// Disarm the timer. A concurrent firing either wins (the timer reads
    /// expired) or loses (it reads inactive); never both.
    pub fn cancel(&self) {
        let prev = self.inner.state.swap(INACTIVE, Ordering::AcqRel);
        if prev == ARMED {
            let cpu = self.inner.cpu.load(Ordering::Relaxed);
            let dl = self.inner.deadline.load(Ordering::Relaxed);
            kernel::get().cpu(cpu).timers.lock().remove(dl, self.inner.id);
        }
    }

    pub fn expired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == EXPIRED
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Waitable for Timer {
    fn poll(&self) -> bool {
        self.expired()
    }
    // The caller arms the timer explicitly before waiting on it.
    fn arm(&self, _mtx: &RawMutex) {}
    fn disarm(&self, _mtx: &RawMutex) {}
}

// ── Per-CPU deadline set ────────────────────────────────────────

pub(crate) struct TimerList {
    map: BTreeMap<(u64, u64), Arc<TimerShared>>,
}

impl TimerList {
    pub(crate) fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    fn insert(&mut self, deadline: u64, id: u64, t: Arc<TimerShared>) {
        self.map.insert((deadline, id), t);
    }

    fn remove(&mut self, deadline: u64, id: u64) {
        self.map.remove(&(deadline, id));
    }
}

// ── Clock driver ────────────────────────────────────────────────

/// Main loop of the clock-event host thread, spawned by `kernel::init`.
pub(crate) fn clock_driver_loop(k: &'static kernel::Kernel) {
    log::debug!("clock driver online, tick {:?}", k.config().tick);
    let mut to_wake: Vec<Arc<Thread>> = Vec::new();
    loop {
        let now = clock::uptime_nanos();
        let mut earliest: Option<u64> = None;
        for cpu in k.cpus() {
            {
                let mut tl = cpu.timers.lock();
                while let Some((&(dl, _), _)) = tl.map.first_key_value() {
                    if dl > now {
                        earliest = Some(earliest.map_or(dl, |e| e.min(dl)));
                        break;
                    }
                    let (_, t) = tl.map.pop_first().unwrap();
                    if t.state
                        .compare_exchange(ARMED, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        to_wake.push(t.owner.clone());
                    }
                }
            }
            cpu.tick(now);
        }
        for t in to_wake.drain(..) {
            t.wake();
        }
        let tick = k.config().tick_nanos();
        let sleep = earliest
            .map_or(tick, |e| e.saturating_sub(now).min(tick))
            .max(50_000); // floor keeps a pathological deadline from busy-spinning
        std::thread::park_timeout(Duration::from_nanos(sleep));
    }
}
