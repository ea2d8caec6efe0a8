//! Exo-OS sched_ext
//!
//! Primitives for an extensible scheduler: dispatch queues, idle CPU
//! tracking, cpumasks, refcounted task/cgroup handles, and error reporting
//! with deferred teardown. The scheduling policy is supplied by the caller
//! as a [`SchedOps`] implementation; the host kernel drives an
//! [`ScxRuntime`] through its entry points.
//!
//! ```ignore
//! let rt = ScxRuntime::new(ScxConfig::new().with_nr_cpus(4), Arc::new(MyPolicy))?;
//! rt.enable()?;
//! rt.add_task(Task::new(42, "worker", 4))?;
//! rt.wake_up(42, 0, WakeFlags::empty())?;
//! let next = rt.pick_next_task(0);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod libutils;
pub mod logger;
pub mod scheduler;
pub mod sync;

pub use config::ScxConfig;
pub use scheduler::core::{
    dsq_local_on, AtomicCpuMask, CallbackKind, CpuMask, DeqFlags, EnqFlags, ExitInfo, ExitKind,
    ExitSink, Handle, KickFlags, Result, SchedOps, ScxCtx, ScxError, ScxRuntime, SCX_DSQ_GLOBAL,
    SCX_DSQ_INVALID, SCX_DSQ_LOCAL, SCX_DSQ_LOCAL_ON, SCX_SLICE_DFL, SCX_SLICE_INF,
};
pub use scheduler::idle::{PickIdleFlags, WakeFlags};
pub use scheduler::thread::{Cgroup, CgroupId, Pid, Task, TaskRef, TaskState};
