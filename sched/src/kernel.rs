// =============================================================================
// UniOS — The Kernel Context
// =============================================================================
//
// One process-wide context created by `kernel::init`: the virtual CPUs,
// the thread registry, and the state of every subsystem that used to be a
// scattering of globals (RCU reclaim queue, per-CPU worker tables, the
// sleep-channel registry). Service threads — clock driver, per-CPU
// sheriffs, reaper, RCU reclaimer — are spawned once at bootstrap.
//
// `init` is idempotent; the first call wins and later configurations are
// ignored.
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use spin::{Mutex as SpinMutex, Once};

use crate::compat;
use crate::config::{Config, KTHREAD_STACK_SIZE};
use crate::percpu::{self, WorkerItem};
use crate::sched::cpu::Cpu;
use crate::sched::thread::{Attr, Thread};
use crate::sched::{self, timer};
use crate::sync::{rcu, RawMutex, WaitQueue};

static KERNEL: Once<Kernel> = Once::new();

/// Initialize the kernel: create the CPUs and start the service threads.
///
/// Idempotent — subsequent calls return the existing kernel and ignore
/// their `config`.
pub fn init(config: Config) -> &'static Kernel {
    let k = KERNEL.call_once(|| Kernel::new(config));
    if !k.booted.swap(true, Ordering::AcqRel) {
        k.bootstrap();
    }
    k
}

pub(crate) fn get() -> &'static Kernel {
    KERNEL.get().expect("kernel::init has not been called")
}

// ── Subsystem state ─────────────────────────────────────────────

pub(crate) struct PercpuState {
    /// Per-CPU "sheriff has work" flags.
    pub(crate) duty: Box<[AtomicBool]>,
    pub(crate) online: Box<[AtomicBool]>,
    pub(crate) items: SpinMutex<Vec<Arc<WorkerItem>>>,
    pub(crate) cpu_notifiers: SpinMutex<Vec<Box<dyn Fn(u32) + Send + Sync>>>,
    pub(crate) sheriffs: SpinMutex<Vec<Arc<Thread>>>,
}

pub(crate) struct RcuState {
    pub(crate) queue: SpinMutex<Vec<Box<dyn FnOnce() + Send>>>,
    /// Callbacks ever enqueued / ever completed. flush() waits for
    /// done_seq to catch up with the enqueue_seq it saw.
    pub(crate) enqueue_seq: AtomicU64,
    pub(crate) done_seq: AtomicU64,
    pub(crate) flush_mutex: RawMutex,
    pub(crate) flush_wq: WaitQueue,
    /// Read-side sections on threads with no home CPU.
    pub(crate) external_readers: AtomicU64,
}

// ── The kernel ──────────────────────────────────────────────────

pub struct Kernel {
    config: Config,
    cpus: Vec<Arc<Cpu>>,

    /// Every live thread, by id. Weak: the registry must not keep a
    /// terminated thread alive.
    registry: SpinMutex<BTreeMap<u64, Weak<Thread>>>,
    exit_notifiers: SpinMutex<Vec<Arc<dyn Fn() + Send + Sync>>>,

    pub(crate) percpu: PercpuState,
    pub(crate) rcu: RcuState,
    pub(crate) compat_channels: SpinMutex<BTreeMap<usize, Arc<compat::Channel>>>,

    // Service threads.
    clock_thread: Once<std::thread::Thread>,
    reaper: Once<Arc<Thread>>,
    reap_queue: SpinMutex<Vec<Arc<Thread>>>,
    reclaimer: Once<Arc<Thread>>,
    rcu_prod: Once<Arc<WorkerItem>>,
    booted: AtomicBool,
}

impl Kernel {
    fn new(config: Config) -> Kernel {
        let n = config.cpus;
        assert!(n > 0, "kernel needs at least one cpu");
        Kernel {
            cpus: (0..n as u32).map(|i| Arc::new(Cpu::new(i))).collect(),
            registry: SpinMutex::new(BTreeMap::new()),
            exit_notifiers: SpinMutex::new(Vec::new()),
            percpu: PercpuState {
                duty: (0..n).map(|_| AtomicBool::new(false)).collect(),
                online: (0..n).map(|_| AtomicBool::new(false)).collect(),
                items: SpinMutex::new(Vec::new()),
                cpu_notifiers: SpinMutex::new(Vec::new()),
                sheriffs: SpinMutex::new(Vec::new()),
            },
            rcu: RcuState {
                queue: SpinMutex::new(Vec::new()),
                enqueue_seq: AtomicU64::new(0),
                done_seq: AtomicU64::new(0),
                flush_mutex: RawMutex::new(),
                flush_wq: WaitQueue::new(),
                external_readers: AtomicU64::new(0),
            },
            compat_channels: SpinMutex::new(BTreeMap::new()),
            clock_thread: Once::new(),
            reaper: Once::new(),
            reap_queue: SpinMutex::new(Vec::new()),
            reclaimer: Once::new(),
            rcu_prod: Once::new(),
            booted: AtomicBool::new(false),
            config,
        }
    }

    fn bootstrap(&'static self) {
        // Latch the clock origin before anything is scheduled.
        let _ = sched::clock::uptime_nanos();
        log::info!("kernel starting with {} cpus", self.num_cpus());

        let h = std::thread::Builder::new()
            .name("clockevent".into())
            .stack_size(KTHREAD_STACK_SIZE)
            .spawn(move || timer::clock_driver_loop(self))
            .expect("out of memory: cannot allocate thread stack");
        self.clock_thread.call_once(|| h.thread().clone());

        // Sheriffs come up through the CPU notifier chain, like any other
        // per-CPU subsystem.
        percpu::register_cpu_notifier(move |cpu| percpu::spawn_sheriff(self, cpu));
        for cpu in 0..self.num_cpus() as u32 {
            percpu::notify_cpu_up(self, cpu);
        }

        self.reaper.call_once(|| {
            Thread::spawn(
                move || self.reaper_loop(),
                Attr::new().name("reaper").stack(KTHREAD_STACK_SIZE),
            )
        });

        self.rcu_prod.call_once(|| WorkerItem::new(|_| ()));
        self.reclaimer.call_once(|| {
            Thread::spawn(
                move || rcu::reclaimer_loop(self),
                Attr::new().name("rcu-reclaim").stack(KTHREAD_STACK_SIZE),
            )
        });
        log::info!("kernel up");
    }

    // ── Public surface ──────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Number of live (registered, not yet reaped) threads.
    pub fn thread_count(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Register `f` to run in every exiting thread, after its entry
    /// function returns. Notifiers run newest-first.
    pub fn register_exit_notifier(&self, f: impl Fn() + Send + Sync + 'static) {
        self.exit_notifiers.lock().push(Arc::new(f));
    }

    // ── CPU access ──────────────────────────────────────────────

    pub(crate) fn cpu(&self, index: u32) -> &Cpu {
        &self.cpus[index as usize]
    }

    pub(crate) fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    /// Placement: the CPU with the fewest runnable threads, preferring
    /// `prefer` on ties (cache warmth stand-in).
    pub(crate) fn least_loaded_cpu(&self, prefer: Option<u32>) -> u32 {
        let prefer = prefer.filter(|&p| (p as usize) < self.cpus.len());
        let mut best = prefer.unwrap_or(0);
        let mut best_load = self.cpus[best as usize].load();
        for c in &self.cpus {
            let load = c.load();
            if load < best_load {
                best = c.index;
                best_load = load;
            }
        }
        best
    }

    // ── Thread registry and reaping ─────────────────────────────

    pub(crate) fn register_thread(&self, t: &Arc<Thread>) {
        self.registry.lock().insert(t.id(), Arc::downgrade(t));
    }

    pub(crate) fn unregister_thread(&self, id: u64) {
        self.registry.lock().remove(&id);
    }

    /// Queue a terminated detached thread for the reaper.
    pub(crate) fn reap(&self, t: Arc<Thread>) {
        self.reap_queue.lock().push(t);
        if let Some(r) = self.reaper.get() {
            r.wake();
        }
    }

    fn reaper_loop(&self) {
        log::debug!("reaper online");
        loop {
            sched::wait_until(|| !self.reap_queue.lock().is_empty());
            let dead = core::mem::take(&mut *self.reap_queue.lock());
            for t in dead {
                self.unregister_thread(t.id());
                log::trace!("reaped thread {} '{}'", t.id(), t.name());
            }
        }
    }

    pub(crate) fn run_exit_notifiers(&self) {
        let notifiers: Vec<_> = self.exit_notifiers.lock().clone();
        for f in notifiers.iter().rev() {
            f();
        }
    }

    // ── Service-thread pokes ────────────────────────────────────

    /// Wake the clock driver early (a new timer may now be the earliest).
    pub(crate) fn clock_kick(&self) {
        if let Some(h) = self.clock_thread.get() {
            h.unpark();
        }
    }

    /// Raise `cpu`'s sheriff duty flag and wake it.
    pub(crate) fn poke_sheriff(&self, cpu: u32) {
        self.percpu.duty[cpu as usize].store(true, Ordering::Release);
        let sheriff = self.percpu.sheriffs.lock().get(cpu as usize).cloned();
        if let Some(t) = sheriff {
            t.wake();
        }
    }

    pub(crate) fn wake_reclaimer(&self) {
        if let Some(r) = self.reclaimer.get() {
            r.wake();
        }
    }

    /// Force a scheduler pass on every CPU (grace-period nudge).
    pub(crate) fn prod_cpus(&self) {
        if let Some(p) = self.rcu_prod.get() {
            p.signal_all();
        }
    }
}
