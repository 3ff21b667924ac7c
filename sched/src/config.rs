//! Kernel configuration — consumed once by [`crate::kernel::init`].

use core::time::Duration;

/// Default stack size for application threads (64 KiB).
///
/// Host threads run libstd code (formatting, logging) on these stacks, so
/// they need more headroom than a pure kernel stack would.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Stack size for the kernel's own service threads (16 KiB).
///
/// Sheriffs, the reaper and the RCU reclaimer have shallow call graphs.
pub const KTHREAD_STACK_SIZE: usize = 16 * 1024;

/// Fixed-point unit for fair-class weights: 1024 == 1.0.
pub const WEIGHT_UNIT: u32 = 1024;

/// Scheduler parameters, fixed at kernel initialization.
///
/// All setters are chainable:
/// ```ignore
/// let k = kernel::init(Config::new().cpus(4).tick(Duration::from_millis(1)));
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of virtual CPUs.
    pub cpus: usize,
    /// Clock driver period; bounds preemption latency.
    pub tick: Duration,
    /// Minimum time a fair thread runs before an equally-eligible thread
    /// may preempt it. Trades fairness granularity for switch rate.
    pub hysteresis: Duration,
    /// Vruntime credit granted to waking threads so sleepers are scheduled
    /// promptly without starving the queue.
    pub wake_bonus: Duration,
    /// Time slice for real-time threads competing at equal priority.
    pub default_rt_slice: Duration,
    /// Stack size for threads that do not override it in their [`Attr`].
    ///
    /// [`Attr`]: crate::sched::thread::Attr
    pub default_stack: usize,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpus(mut self, n: usize) -> Self {
        assert!(n >= 1, "at least one cpu required");
        self.cpus = n;
        self
    }

    pub fn tick(mut self, d: Duration) -> Self {
        self.tick = d;
        self
    }

    pub fn hysteresis(mut self, d: Duration) -> Self {
        self.hysteresis = d;
        self
    }

    pub fn wake_bonus(mut self, d: Duration) -> Self {
        self.wake_bonus = d;
        self
    }

    pub fn default_rt_slice(mut self, d: Duration) -> Self {
        self.default_rt_slice = d;
        self
    }

    pub fn default_stack(mut self, bytes: usize) -> Self {
        self.default_stack = bytes;
        self
    }

    pub(crate) fn tick_nanos(&self) -> u64 {
        self.tick.as_nanos() as u64
    }

    pub(crate) fn hysteresis_nanos(&self) -> u64 {
        self.hysteresis.as_nanos() as u64
    }

    pub(crate) fn wake_bonus_nanos(&self) -> u64 {
        self.wake_bonus.as_nanos() as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(4);
        Self {
            cpus,
            tick: Duration::from_millis(1),
            hysteresis: Duration::from_millis(2),
            wake_bonus: Duration::from_millis(1),
            default_rt_slice: Duration::from_millis(10),
            default_stack: DEFAULT_STACK_SIZE,
        }
    }
}
