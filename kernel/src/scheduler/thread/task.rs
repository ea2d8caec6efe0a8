//! Task - host-owned schedulable entity
//!
//! The host creates a [`Task`] and hands it to the runtime, which publishes
//! it in the task table. Policies only ever see [`TaskRef`] handles.
//! Scheduler-side state lives in [`TaskScx`] behind the task lock, which is
//! always taken before any DSQ lock.

use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard, RwLock};

use super::cgroup::Cgroup;
use super::state::{validate_transition, TaskFlags, TaskState};
use crate::scheduler::core::cpumask::CpuMask;
use crate::scheduler::core::kref::{Handle, KptrSlot};
use crate::scheduler::core::policy::SCX_DSQ_INVALID;

/// Process id
pub type Pid = i32;

/// Handle to a live task
pub type TaskRef = Handle<Task>;

/// Default task weight, nice 0
pub const WEIGHT_DFL: u32 = 100;

/// Scheduler-side task state, guarded by the task lock
#[derive(Debug, Clone, Copy)]
pub struct TaskScx {
    pub state: TaskState,
    pub flags: TaskFlags,
    /// DSQ the task sits on, `SCX_DSQ_INVALID` when not queued
    pub dsq_id: u64,
    /// Bumped on every queue transition. A DSQ entry whose seq doesn't match
    /// is stale.
    pub seq: u64,
    /// Remaining slice in ns
    pub slice: u64,
    pub dsq_vtime: u64,
    /// CPU the task last ran on, or was last placed on
    pub cpu: u32,
}

impl TaskScx {
    const fn new(cpu: u32) -> Self {
        Self {
            state: TaskState::NotQueued,
            flags: TaskFlags::empty(),
            dsq_id: SCX_DSQ_INVALID,
            seq: 0,
            slice: 0,
            dsq_vtime: 0,
            cpu,
        }
    }

    /// Move along the dispatch state machine
    pub fn transition(&mut self, to: TaskState) {
        debug_assert!(
            validate_transition(self.state, to),
            "bad task state transition {} -> {}",
            self.state,
            to
        );
        self.state = to;
    }
}

/// A schedulable task
pub struct Task {
    pid: Pid,
    comm: String,
    weight: AtomicU32,
    /// Opted in to the policy even without `switch_all()`
    sched_ext: bool,
    cpus_allowed: RwLock<CpuMask>,
    cgroup: KptrSlot<Cgroup>,
    scx: Mutex<TaskScx>,
}

impl Task {
    /// New task allowed on every CPU, starting on CPU 0
    pub fn new(pid: Pid, comm: &str, nr_cpus: u32) -> Self {
        Self {
            pid,
            comm: String::from(comm),
            weight: AtomicU32::new(WEIGHT_DFL),
            sched_ext: false,
            cpus_allowed: RwLock::new(CpuMask::all(nr_cpus)),
            cgroup: KptrSlot::new(),
            scx: Mutex::new(TaskScx::new(0)),
        }
    }

    pub fn with_weight(self, weight: u32) -> Self {
        self.weight.store(weight.max(1), Ordering::Relaxed);
        self
    }

    pub fn with_cpus_allowed(self, mask: CpuMask) -> Self {
        *self.cpus_allowed.write() = mask;
        self
    }

    pub fn with_cpu(self, cpu: u32) -> Self {
        self.scx.lock().cpu = cpu;
        self
    }

    pub fn with_cgroup(self, cgrp: Handle<Cgroup>) -> Self {
        if let Some(old) = self.cgroup.xchg(Some(cgrp)) {
            old.release();
        }
        self
    }

    pub fn sched_ext(mut self) -> Self {
        self.sched_ext = true;
        self
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn comm(&self) -> &str {
        &self.comm
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    pub fn is_sched_ext(&self) -> bool {
        self.sched_ext
    }

    /// Snapshot of the allowed CPUs
    pub fn cpus_allowed(&self) -> CpuMask {
        *self.cpus_allowed.read()
    }

    pub fn nr_cpus_allowed(&self) -> u32 {
        self.cpus_allowed.read().weight()
    }

    pub fn set_cpus_allowed(&self, mask: CpuMask) {
        *self.cpus_allowed.write() = mask;
    }

    /// Cgroup membership, a new reference
    pub fn cgroup(&self) -> Option<Handle<Cgroup>> {
        self.cgroup.peek()
    }

    /// Move to another cgroup
    pub fn set_cgroup(&self, cgrp: Option<Handle<Cgroup>>) {
        if let Some(old) = self.cgroup.xchg(cgrp) {
            old.release();
        }
    }

    /// Lock the scheduler-side state
    #[inline]
    pub fn scx(&self) -> MutexGuard<'_, TaskScx> {
        self.scx.lock()
    }

    /// Racy read of the current state
    pub fn state(&self) -> TaskState {
        self.scx.lock().state
    }

    pub fn cpu(&self) -> u32 {
        self.scx.lock().cpu
    }

    pub fn slice(&self) -> u64 {
        self.scx.lock().slice
    }

    pub fn dsq_vtime(&self) -> u64 {
        self.scx.lock().dsq_vtime
    }

    pub fn set_dsq_vtime(&self, vtime: u64) {
        self.scx.lock().dsq_vtime = vtime;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("comm", &self.comm)
            .field("weight", &self.weight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let t = Task::new(42, "worker", 4)
            .with_weight(0)
            .with_cpu(3)
            .with_cpus_allowed(CpuMask::from_cpus(4, [1, 3]));
        assert_eq!(t.pid(), 42);
        assert_eq!(t.comm(), "worker");
        assert_eq!(t.weight(), 1);
        assert_eq!(t.cpu(), 3);
        assert_eq!(t.nr_cpus_allowed(), 2);
        assert_eq!(t.state(), TaskState::NotQueued);
        assert_eq!(t.scx().dsq_id, SCX_DSQ_INVALID);
    }

    #[test]
    fn test_cgroup_ref_moves() {
        let root = Handle::new(Cgroup::root(1));
        let t = Task::new(1, "a", 2).with_cgroup(root.acquire());
        assert_eq!(root.refcount(), 2);
        let got = t.cgroup().unwrap();
        assert_eq!(got.id(), 1);
        got.release();
        t.set_cgroup(None);
        assert_eq!(root.refcount(), 1);
    }
}
