//! Extensible scheduler
//!
//! A host kernel drives [`ScxRuntime`] through its entry points; the
//! scheduling decisions come from a [`SchedOps`] policy.

pub mod core;
pub mod idle;
pub mod thread;

pub use self::core::{
    CallbackKind, DeqFlags, EnqFlags, ExitInfo, ExitKind, KickFlags, Result, SchedOps, ScxCtx,
    ScxError, ScxRuntime,
};
pub use idle::{IdleTracker, PickIdleFlags, WakeFlags};
pub use thread::{Cgroup, CgroupId, Pid, Task, TaskRef, TaskState};
