// =============================================================================
// UniOS — Per-CPU Workers
// =============================================================================
//
// A WorkerItem is a handler plus one pending bit per CPU. `signal(cpu)`
// sets the bit and pokes that CPU's *sheriff*, a pinned real-time thread
// that drains every pending item on its CPU. Signalling is the moral
// equivalent of sending an IPI: cheap from any thread, handled promptly
// on the target CPU because the sheriff outranks everything fair-class.
//
// CPU bring-up runs through notifiers; the sheriffs themselves are
// spawned by one, registered before the CPUs are marked online.
// =============================================================================

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::kernel::{self, Kernel};
use crate::sched;
use crate::sched::thread::{Attr, Thread};

/// A per-CPU work item: one handler, one pending bit per CPU.
///
/// Registered once via [`WorkerItem::new`]; lives for the kernel's
/// lifetime.
pub struct WorkerItem {
    pending: Box<[AtomicBool]>,
    handler: Box<dyn Fn(u32) + Send + Sync>,
}

impl WorkerItem {
    /// Register a handler; it runs on CPU `c` (pinned, on the sheriff)
    /// each time `signal(c)` is called.
    pub fn new(handler: impl Fn(u32) + Send + Sync + 'static) -> Arc<Self> {
        let k = kernel::get();
        let item = Arc::new(Self {
            pending: (0..k.num_cpus()).map(|_| AtomicBool::new(false)).collect(),
            handler: Box::new(handler),
        });
        k.percpu.items.lock().push(item.clone());
        item
    }

    /// Request a run of the handler on `cpu`. Coalesces: several signals
    /// before the sheriff gets there produce one run.
    pub fn signal(&self, cpu: u32) {
        self.pending[cpu as usize].store(true, Ordering::Release);
        kernel::get().poke_sheriff(cpu);
    }

    /// Request a run on every CPU.
    pub fn signal_all(&self) {
        let k = kernel::get();
        for cpu in 0..k.num_cpus() as u32 {
            self.signal(cpu);
        }
    }
}

/// Run `f(cpu)` as each CPU comes online — immediately for CPUs that
/// already are. Used by subsystems that keep per-CPU state.
pub fn register_cpu_notifier(f: impl Fn(u32) + Send + Sync + 'static) {
    let k = kernel::get();
    let f: Box<dyn Fn(u32) + Send + Sync> = Box::new(f);
    let mut notifiers = k.percpu.cpu_notifiers.lock();
    for (i, online) in k.percpu.online.iter().enumerate() {
        if online.load(Ordering::Acquire) {
            f(i as u32);
        }
    }
    notifiers.push(f);
}

/// Mark `cpu` online and run the bring-up notifiers for it. Called from
/// kernel bootstrap; the notifier lock serializes this against
/// registration.
pub(crate) fn notify_cpu_up(k: &'static Kernel, cpu: u32) {
    let notifiers = k.percpu.cpu_notifiers.lock();
    k.percpu.online[cpu as usize].store(true, Ordering::Release);
    for f in notifiers.iter() {
        f(cpu);
    }
    log::debug!("cpu{} online", cpu);
}

/// The bring-up notifier that spawns each CPU's sheriff.
pub(crate) fn spawn_sheriff(k: &'static Kernel, cpu: u32) {
    let t = Thread::spawn(
        move || sheriff_loop(k, cpu),
        Attr::new()
            .name(format!("sheriff/{}", cpu))
            .pin(cpu as usize)
            .realtime(u32::MAX)
            .stack(crate::config::KTHREAD_STACK_SIZE),
    );
    k.percpu.sheriffs.lock().push(t);
}

fn sheriff_loop(k: &'static Kernel, cpu: u32) {
    log::debug!("sheriff online on cpu{}", cpu);
    let duty = &k.percpu.duty[cpu as usize];
    loop {
        sched::wait_until(|| duty.load(Ordering::Acquire));
        // Clear before draining: a signal that lands mid-drain re-raises
        // duty and we go around again.
        duty.store(false, Ordering::Release);
        let items: Vec<Arc<WorkerItem>> = k.percpu.items.lock().clone();
        for item in items {
            if item.pending[cpu as usize].swap(false, Ordering::AcqRel) {
                (item.handler)(cpu);
            }
        }
    }
}
