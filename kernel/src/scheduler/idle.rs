//! Idle CPU tracking
//!
//! Two process-wide masks, both updated racily by the host as CPUs enter and
//! leave idle:
//! - `cpus`: every idle CPU
//! - `smt`: CPUs whose whole core is idle
//!
//! Policies claim an idle CPU with [`IdleTracker::test_and_clear_cpu_idle`].
//! A pick is a snapshot: by the time the caller acts on it another CPU may
//! have claimed it, which is why every pick loops on test-and-clear.

use bitflags::bitflags;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use super::core::cpumask::{AtomicCpuMask, CpuMask};
use super::core::topology::Topology;
use super::thread::Task;

bitflags! {
    /// `pick_idle_cpu()` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PickIdleFlags: u64 {
        /// Only return a CPU whose whole core is idle
        const CORE = 1 << 0;
    }
}

bitflags! {
    /// Wake flags passed to `ops.select_cpu()`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeFlags: u64 {
        const FORK = 0x04;
        const TTWU = 0x08;
        const SYNC = 0x10;
    }
}

/// Built-in idle tracking
pub struct IdleTracker {
    topology: Topology,
    cpus: AtomicCpuMask,
    smt: AtomicCpuMask,
    /// Idle masks handed out and not yet put back
    outstanding: AtomicU32,
}

impl IdleTracker {
    /// All CPUs start busy
    pub fn new(topology: Topology) -> Self {
        let nr = topology.nr_cpus();
        Self {
            topology,
            cpus: AtomicCpuMask::new(nr),
            smt: AtomicCpuMask::new(nr),
            outstanding: AtomicU32::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Consider every CPU idle. Converges to the real state as CPUs run.
    pub fn reset(&self) {
        self.cpus.setall();
        if self.topology.smt_enabled() {
            self.smt.setall();
        }
    }

    /// Record an idle transition of `cpu`
    pub fn update(&self, cpu: u32, idle: bool) {
        if cpu >= self.topology.nr_cpus() {
            return;
        }
        let smt_active = self.topology.smt_enabled();

        if idle {
            self.cpus.set_cpu(cpu);
            if smt_active {
                let siblings = self.topology.smt_mask(cpu);
                if siblings.subset(&self.cpus.load()) {
                    for sib in &siblings {
                        self.smt.set_cpu(sib);
                    }
                }
            }
        } else {
            self.cpus.clear_cpu(cpu);
            if smt_active {
                let siblings = self.topology.smt_mask(cpu);
                if siblings.intersects(&self.smt.load()) {
                    for sib in &siblings {
                        self.smt.clear_cpu(sib);
                    }
                }
            }
        }
        log::trace!("idle: cpu {} {}", cpu, if idle { "enters" } else { "leaves" });
    }

    /// Racy check, does not claim
    #[inline]
    pub fn is_idle(&self, cpu: u32) -> bool {
        self.cpus.test_cpu(cpu)
    }

    /// Claim `cpu` if it is idle. Exactly one of several racing claimers
    /// gets `true`. The core stops counting as wholly idle.
    pub fn test_and_clear_cpu_idle(&self, cpu: u32) -> bool {
        if self.topology.smt_enabled() {
            let siblings = self.topology.smt_mask(cpu);
            if siblings.intersects(&self.smt.load()) {
                for sib in &siblings {
                    self.smt.clear_cpu(sib);
                }
            } else {
                // Not its own sibling: make sure it can't stay set forever
                self.smt.clear_cpu(cpu);
            }
        }
        self.cpus.test_and_clear_cpu(cpu)
    }

    /// Find and claim an idle CPU in `allowed`. Prefers CPUs on wholly idle
    /// cores; with [`PickIdleFlags::CORE`] only those qualify.
    pub fn pick_idle_cpu(&self, allowed: &CpuMask, flags: PickIdleFlags) -> Option<u32> {
        loop {
            let mut cpu = None;
            if self.topology.smt_enabled() {
                cpu = self.smt.load().any_and_distribute(allowed);
                if cpu.is_none() && flags.contains(PickIdleFlags::CORE) {
                    return None;
                }
            }
            let cpu = match cpu {
                Some(cpu) => cpu,
                None => self.cpus.load().any_and_distribute(allowed)?,
            };
            if self.test_and_clear_cpu_idle(cpu) {
                return Some(cpu);
            }
        }
    }

    /// Idle CPU if there is one, otherwise any CPU in `allowed`
    pub fn pick_any_cpu(&self, allowed: &CpuMask, flags: PickIdleFlags) -> Option<u32> {
        self.pick_idle_cpu(allowed, flags).or_else(|| allowed.any_distribute())
    }

    /// Default CPU selection for a waking task. Returns the CPU and whether
    /// it was claimed idle.
    ///
    /// `waker` is the waking CPU when its local queue is empty: for sync
    /// wakeups the wakee then follows the waker.
    pub fn select_cpu_dfl(
        &self,
        p: &Task,
        prev_cpu: u32,
        wake_flags: WakeFlags,
        waker: Option<u32>,
    ) -> (u32, bool) {
        let allowed = p.cpus_allowed();
        let nr_allowed = allowed.weight();

        if wake_flags.contains(WakeFlags::SYNC) && nr_allowed > 1 && !self.cpus.load().empty() {
            if let Some(cpu) = waker.filter(|&c| allowed.test_cpu(c)) {
                return (cpu, true);
            }
        }

        if nr_allowed == 1 {
            if self.test_and_clear_cpu_idle(prev_cpu) {
                return (prev_cpu, true);
            }
            return (prev_cpu, false);
        }

        if self.topology.smt_enabled() {
            if self.smt.test_cpu(prev_cpu) && self.test_and_clear_cpu_idle(prev_cpu) {
                return (prev_cpu, true);
            }
            if let Some(cpu) = self.pick_idle_cpu(&allowed, PickIdleFlags::CORE) {
                return (cpu, true);
            }
        }

        if allowed.test_cpu(prev_cpu) && self.test_and_clear_cpu_idle(prev_cpu) {
            return (prev_cpu, true);
        }

        match self.pick_idle_cpu(&allowed, PickIdleFlags::empty()) {
            Some(cpu) => (cpu, true),
            None => (prev_cpu, false),
        }
    }

    /// Scoped snapshot of the idle CPUs. Put back by dropping the guard or
    /// [`Self::put_idle_cpumask`].
    pub fn get_idle_cpumask(&self) -> IdleMaskGuard<'_> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        IdleMaskGuard { tracker: self, mask: self.cpus.load() }
    }

    /// Scoped snapshot of the CPUs whose whole core is idle. Without SMT this
    /// is the idle CPU mask.
    pub fn get_idle_smtmask(&self) -> IdleMaskGuard<'_> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let mask = if self.topology.smt_enabled() { self.smt.load() } else { self.cpus.load() };
        IdleMaskGuard { tracker: self, mask }
    }

    pub fn put_idle_cpumask(&self, guard: IdleMaskGuard<'_>) {
        drop(guard);
    }

    /// Masks handed out and not yet put back
    pub fn nr_outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Relaxed)
    }
}

/// Read-only idle mask, valid until dropped
pub struct IdleMaskGuard<'a> {
    tracker: &'a IdleTracker,
    mask: CpuMask,
}

impl Deref for IdleMaskGuard<'_> {
    type Target = CpuMask;

    fn deref(&self) -> &CpuMask {
        &self.mask
    }
}

impl Drop for IdleMaskGuard<'_> {
    fn drop(&mut self) {
        self.tracker.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(nr: u32, smt: u32) -> IdleTracker {
        IdleTracker::new(Topology::new(nr, smt))
    }

    #[test]
    fn test_smt_mask_follows_whole_cores() {
        let t = tracker(8, 2);
        t.update(2, true);
        assert!(!t.get_idle_smtmask().test_cpu(2));
        t.update(3, true);
        {
            let smt = t.get_idle_smtmask();
            assert!(smt.test_cpu(2) && smt.test_cpu(3));
            assert_eq!(t.nr_outstanding(), 1);
        }
        assert_eq!(t.nr_outstanding(), 0);
        t.update(3, false);
        assert!(t.get_idle_smtmask().empty());
        assert!(t.is_idle(2));
    }

    #[test]
    fn test_claim_clears_core() {
        let t = tracker(4, 2);
        t.update(0, true);
        t.update(1, true);
        assert!(t.test_and_clear_cpu_idle(0));
        assert!(t.get_idle_smtmask().empty());
        assert!(t.is_idle(1));
        assert!(!t.test_and_clear_cpu_idle(0));
    }

    #[test]
    fn test_pick_prefers_idle_core() {
        let t = tracker(8, 2);
        // Core 0 half idle, core 2 fully idle
        t.update(1, true);
        t.update(4, true);
        t.update(5, true);
        let all = CpuMask::all(8);
        let cpu = t.pick_idle_cpu(&all, PickIdleFlags::CORE).unwrap();
        assert!(cpu == 4 || cpu == 5);
        assert_eq!(t.pick_idle_cpu(&all, PickIdleFlags::CORE), None);
        // Without CORE the remaining idle threads are still available
        let rest = [t.pick_idle_cpu(&all, PickIdleFlags::empty()), t.pick_idle_cpu(&all, PickIdleFlags::empty())];
        assert!(rest.contains(&Some(1)));
        assert_eq!(t.pick_idle_cpu(&all, PickIdleFlags::empty()), None);
        assert!(t.pick_any_cpu(&CpuMask::from_cpus(8, [6]), PickIdleFlags::empty()) == Some(6));
    }

    #[test]
    fn test_select_cpu_dfl_single_cpu_task() {
        let t = tracker(4, 1);
        let p = Task::new(1, "pinned", 4).with_cpus_allowed(CpuMask::from_cpus(4, [2]));
        assert_eq!(t.select_cpu_dfl(&p, 2, WakeFlags::empty(), None), (2, false));
        t.update(2, true);
        assert_eq!(t.select_cpu_dfl(&p, 2, WakeFlags::empty(), None), (2, true));
        assert!(!t.is_idle(2));
    }

    #[test]
    fn test_select_cpu_dfl_sync_follows_waker() {
        let t = tracker(4, 1);
        t.update(0, true);
        let p = Task::new(1, "wakee", 4);
        assert_eq!(t.select_cpu_dfl(&p, 1, WakeFlags::SYNC, Some(3)), (3, true));
        // Waker not eligible: falls through to an idle pick
        assert_eq!(t.select_cpu_dfl(&p, 1, WakeFlags::SYNC, None), (0, true));
    }
}
