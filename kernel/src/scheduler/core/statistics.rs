//! Statistics - sched_ext event counters
//!
//! Counters are bumped with relaxed atomics from every CPU; a snapshot is
//! only approximately consistent.

use core::sync::atomic::{AtomicU64, Ordering};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::member_vptr;

/// Counter ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ScxStat {
    /// Dispatches applied to a DSQ
    Dispatched = 0,
    /// Dispatches straight to a local DSQ
    DispatchedLocal,
    /// Dispatches that ended on the global DSQ because the target was unusable
    FallbackGlobal,
    /// Buffered dispatches dropped because the task moved on
    DispatchIgnored,
    /// Successful `consume()` calls
    Consumed,
    /// Stale DSQ entries discarded
    Stale,
    /// `ops.enqueue()` invocations
    Enqueued,
    /// Tasks taken off the runnable set
    Dequeued,
    /// Tasks handed to a CPU by `pick_next_task`
    Picked,
    /// `pick_next_task` found nothing
    IdlePicks,
    /// Kicks delivered
    Kicks,
    /// Local tasks re-enqueued
    Reenqueued,
    /// `ops.dispatch()` invocations
    DispatchCalls,
}

pub const NR_STATS: usize = ScxStat::DispatchCalls as usize + 1;

/// Live counters
pub struct ScxStats {
    counters: [AtomicU64; NR_STATS],
}

impl ScxStats {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self { counters: [ZERO; NR_STATS] }
    }

    #[inline]
    pub fn inc(&self, stat: ScxStat) {
        self.add(stat, 1);
    }

    #[inline]
    pub fn add(&self, stat: ScxStat, n: u64) {
        self.counters[stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, stat: ScxStat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for c in self.counters.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::new_zeroed();
        for (dst, src) in snap.counters.iter_mut().zip(self.counters.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        snap
    }
}

impl Default for ScxStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of the counters, as handed to user space
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct StatsSnapshot {
    pub counters: [u64; NR_STATS],
    /// Tasks queued on the global DSQ when the snapshot was taken
    pub nr_global: u64,
    /// Tasks queued on user DSQs when the snapshot was taken
    pub nr_user: u64,
}

impl StatsSnapshot {
    /// Counter by raw index, `None` past the last counter
    pub fn counter(&self, idx: usize) -> Option<u64> {
        member_vptr!(*self, StatsSnapshot, counters[idx] as u64)
            .filter(|_| idx < NR_STATS)
            .copied()
    }

    #[inline]
    pub fn get(&self, stat: ScxStat) -> u64 {
        self.counters[stat as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::const_assert_eq!(
        core::mem::size_of::<StatsSnapshot>(),
        (NR_STATS + 2) * core::mem::size_of::<u64>()
    );

    #[test]
    fn test_counters_and_snapshot() {
        let stats = ScxStats::new();
        stats.inc(ScxStat::Dispatched);
        stats.add(ScxStat::Consumed, 3);
        let snap = stats.snapshot();
        assert_eq!(snap.get(ScxStat::Dispatched), 1);
        assert_eq!(snap.counter(ScxStat::Consumed as usize), Some(3));
        assert_eq!(snap.counter(NR_STATS), None);
        assert_eq!(snap.counter(usize::MAX), None);
        stats.reset();
        assert_eq!(stats.get(ScxStat::Consumed), 0);
    }
}
