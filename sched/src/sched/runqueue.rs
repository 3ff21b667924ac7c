//! Per-CPU ready queues.
//!
//! Two classes: a fair queue ordered by virtual runtime, and a real-time
//! queue ordered by priority. The real-time queue strictly precedes the
//! fair one; within it, equal priorities run in FIFO order by insertion
//! sequence. The fair queue breaks vruntime ties the same way, so equally
//! eligible threads round-robin instead of ping-ponging on one id.

use core::cmp::{Ordering as CmpOrdering, Reverse};
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::thread::Thread;

/// Insertion sequence numbers. Global so that a sequence assigned on one
/// CPU remains unique after the thread migrates to another.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

struct FairEntry {
    vruntime: u64,
    seq: u64,
    thread: Arc<Thread>,
}

impl PartialEq for FairEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for FairEntry {}
impl PartialOrd for FairEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for FairEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.vruntime, self.seq).cmp(&(other.vruntime, other.seq))
    }
}

struct RtEntry {
    priority: u32,
    seq: u64,
    thread: Arc<Thread>,
}

impl PartialEq for RtEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for RtEntry {}
impl PartialOrd for RtEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for RtEntry {
    // Highest priority first, then FIFO.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (Reverse(self.priority), self.seq).cmp(&(Reverse(other.priority), other.seq))
    }
}

pub(crate) struct RunQueue {
    fair: BTreeSet<FairEntry>,
    rt: BTreeSet<RtEntry>,
    /// Monotonic floor for fair-queue placement; newly waking threads are
    /// slotted just below it so they run soon without erasing history.
    min_vruntime: u64,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            fair: BTreeSet::new(),
            rt: BTreeSet::new(),
            min_vruntime: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.fair.len() + self.rt.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fair.is_empty() && self.rt.is_empty()
    }

    pub(crate) fn min_vruntime(&self) -> u64 {
        self.min_vruntime
    }

    /// Advance the placement floor; it never moves backwards.
    pub(crate) fn note_min(&mut self, vruntime: u64) {
        self.min_vruntime = self.min_vruntime.max(vruntime);
    }

    /// Insert a thread according to its class. The caller has already set
    /// the thread's status and placement vruntime.
    pub(crate) fn insert(&mut self, thread: Arc<Thread>) {
        match thread.rt_params() {
            Some(rt) => {
                // Reuse a preserved sequence so a thread preempted by a
                // higher priority keeps its FIFO position; otherwise go to
                // the back of its priority tier.
                let seq = thread.queue_seq().unwrap_or_else(next_seq);
                thread.store_queue_seq(seq);
                self.rt.insert(RtEntry {
                    priority: rt.priority,
                    seq,
                    thread,
                });
            }
            None => {
                self.fair.insert(FairEntry {
                    vruntime: thread.vruntime(),
                    seq: next_seq(),
                    thread,
                });
            }
        }
    }

    /// Remove and return the most eligible thread.
    pub(crate) fn pop(&mut self) -> Option<Arc<Thread>> {
        if let Some(e) = self.rt.pop_first() {
            return Some(e.thread);
        }
        if let Some(e) = self.fair.pop_first() {
            self.min_vruntime = self.min_vruntime.max(e.vruntime);
            return Some(e.thread);
        }
        None
    }

    pub(crate) fn best_rt_priority(&self) -> Option<u32> {
        self.rt.first().map(|e| e.priority)
    }

    pub(crate) fn best_fair_vruntime(&self) -> Option<u64> {
        self.fair.first().map(|e| e.vruntime)
    }

    /// Remove one fair-class, unpinned thread for migration to an idle
    /// CPU, or None if nothing here may move.
    pub(crate) fn take_migratable(&mut self) -> Option<Arc<Thread>> {
        // Clone the key out first; BTreeSet has no remove-by-predicate.
        let entry = self
            .fair
            .iter()
            .find(|e| !e.thread.is_pinned())
            .map(|e| FairEntry {
                vruntime: e.vruntime,
                seq: e.seq,
                thread: e.thread.clone(),
            })?;
        self.fair.remove(&entry);
        Some(entry.thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel;
    use crate::sched::thread::Attr;

    fn mk(attr: Attr) -> Arc<Thread> {
        kernel::init(Config::new());
        Thread::make(|| {}, attr)
    }

    #[test]
    fn fair_orders_by_vruntime() {
        let mut q = RunQueue::new();
        let a = mk(Attr::new().name("a"));
        let b = mk(Attr::new().name("b"));
        a.set_vruntime(200);
        b.set_vruntime(100);
        q.insert(a.clone());
        q.insert(b.clone());
        assert_eq!(q.pop().unwrap().id(), b.id());
        assert_eq!(q.pop().unwrap().id(), a.id());
        assert!(q.pop().is_none());
    }

    #[test]
    fn equal_vruntime_is_fifo() {
        let mut q = RunQueue::new();
        let a = mk(Attr::new().name("a"));
        let b = mk(Attr::new().name("b"));
        a.set_vruntime(500);
        b.set_vruntime(500);
        q.insert(a.clone());
        q.insert(b.clone());
        assert_eq!(q.pop().unwrap().id(), a.id());
        assert_eq!(q.pop().unwrap().id(), b.id());
    }

    #[test]
    fn realtime_precedes_fair_and_orders_by_priority() {
        let mut q = RunQueue::new();
        let fair = mk(Attr::new().name("fair"));
        let low = mk(Attr::new().name("rt-low").realtime(1));
        let high = mk(Attr::new().name("rt-high").realtime(9));
        fair.set_vruntime(0);
        q.insert(fair.clone());
        q.insert(low.clone());
        q.insert(high.clone());
        assert_eq!(q.pop().unwrap().id(), high.id());
        assert_eq!(q.pop().unwrap().id(), low.id());
        assert_eq!(q.pop().unwrap().id(), fair.id());
    }

    #[test]
    fn preserved_sequence_keeps_fifo_position() {
        let mut q = RunQueue::new();
        let a = mk(Attr::new().name("a").realtime(5));
        let b = mk(Attr::new().name("b").realtime(5));
        a.clear_queue_seq();
        b.clear_queue_seq();
        q.insert(a.clone());
        q.insert(b.clone());
        // Simulate a dispatching and being preempted by higher priority:
        // it keeps its stored seq, so it re-enters ahead of b.
        let first = q.pop().unwrap();
        assert_eq!(first.id(), a.id());
        q.insert(first);
        assert_eq!(q.pop().unwrap().id(), a.id());
        // After a slice rotation the seq is cleared and a goes behind b.
        let rotated = q.pop().unwrap();
        assert_eq!(rotated.id(), b.id());
        q.insert(rotated);
        a.clear_queue_seq();
        q.insert(a.clone());
        assert_eq!(q.pop().unwrap().id(), b.id());
        assert_eq!(q.pop().unwrap().id(), a.id());
    }

    #[test]
    fn take_migratable_skips_pinned() {
        let mut q = RunQueue::new();
        let pinned = mk(Attr::new().name("pinned").pin(0));
        let free = mk(Attr::new().name("free"));
        q.insert(pinned.clone());
        q.insert(free.clone());
        let got = q.take_migratable().unwrap();
        assert_eq!(got.id(), free.id());
        assert_eq!(q.len(), 1);
        assert!(q.take_migratable().is_none());
    }
}
