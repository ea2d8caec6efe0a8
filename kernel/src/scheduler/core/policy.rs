//! Policy - the callback surface a scheduling policy implements
//!
//! A policy is a [`SchedOps`] implementation. The runtime invokes its
//! callbacks from host entry points; each callback gets a [`ScxCtx`]
//! exposing the primitive operations and must return without blocking.
//!
//! Every callback has a default that matches what the host does when the
//! policy leaves the operation out, so a policy that implements nothing is
//! a working global FIFO scheduler.

use bitflags::bitflags;

use super::error::Result;
use super::exit::ExitInfo;
use super::scheduler::ScxCtx;
use crate::scheduler::idle::WakeFlags;
use crate::scheduler::thread::TaskRef;

// ═══════════════════════════════════════════════════════════════
// DSQ ids
// ═══════════════════════════════════════════════════════════════

/// Built-in DSQ. User DSQ ids may not carry it.
pub const SCX_DSQ_FLAG_BUILTIN: u64 = 1 << 63;
/// Built-in local DSQ of the CPU in the low bits
pub const SCX_DSQ_FLAG_LOCAL_ON: u64 = 1 << 62;

pub const SCX_DSQ_INVALID: u64 = SCX_DSQ_FLAG_BUILTIN;
pub const SCX_DSQ_GLOBAL: u64 = SCX_DSQ_FLAG_BUILTIN | 1;
/// Local DSQ of the CPU the callback is about
pub const SCX_DSQ_LOCAL: u64 = SCX_DSQ_FLAG_BUILTIN | 2;
pub const SCX_DSQ_LOCAL_ON: u64 = SCX_DSQ_FLAG_BUILTIN | SCX_DSQ_FLAG_LOCAL_ON;
pub const SCX_DSQ_LOCAL_CPU_MASK: u64 = 0xffff_ffff;

/// Id of the local DSQ of `cpu`
#[inline]
pub const fn dsq_local_on(cpu: u32) -> u64 {
    SCX_DSQ_LOCAL_ON | cpu as u64
}

/// Default slice, 20ms
pub const SCX_SLICE_DFL: u64 = 20_000_000;
/// Never expires
pub const SCX_SLICE_INF: u64 = u64::MAX;

// ═══════════════════════════════════════════════════════════════
// Flags
// ═══════════════════════════════════════════════════════════════

bitflags! {
    /// Enqueue and dispatch flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqFlags: u64 {
        /// Task just woke up
        const WAKEUP = 1 << 0;
        /// Insert at the head of a FIFO DSQ
        const HEAD = 1 << 4;
        /// Preempt the current task of the target CPU
        const PREEMPT = 1 << 32;
        /// Re-enqueued by `reenqueue_local()`
        const REENQ = 1 << 40;
        /// Last runnable task on the CPU
        const LAST = 1 << 41;
    }
}

bitflags! {
    /// `ops.dequeue()` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeqFlags: u64 {
        /// Task is going to sleep
        const SLEEP = 1 << 0;
    }
}

bitflags! {
    /// `kick_cpu()` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KickFlags: u64 {
        /// Only kick if the target is idle
        const IDLE = 1 << 0;
        /// Expire the slice of the target's current task
        const PREEMPT = 1 << 1;
        /// Caller wants to wait for the target to go through a schedule
        const WAIT = 1 << 2;
    }
}

/// Which callback a context belongs to. Decides which primitives are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Init,
    SelectCpu,
    Enqueue,
    Dequeue,
    Dispatch,
    Running,
    Stopping,
    Enable,
    Disable,
    UpdateIdle,
}

impl CallbackKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "ops.init()",
            Self::SelectCpu => "ops.select_cpu()",
            Self::Enqueue => "ops.enqueue()",
            Self::Dequeue => "ops.dequeue()",
            Self::Dispatch => "ops.dispatch()",
            Self::Running => "ops.running()",
            Self::Stopping => "ops.stopping()",
            Self::Enable => "ops.enable()",
            Self::Disable => "ops.disable()",
            Self::UpdateIdle => "ops.update_idle()",
        }
    }

    /// `dispatch()`/`dispatch_vtime()` allowed
    pub fn may_dispatch(&self) -> bool {
        matches!(self, Self::SelectCpu | Self::Enqueue | Self::Dispatch)
    }
}

/// A scheduling policy
#[allow(unused_variables)]
pub trait SchedOps: Send + Sync {
    fn name(&self) -> &str;

    /// Called once on enable, before any task is handed over. Typical work:
    /// creating DSQs.
    fn init(&self, ctx: &mut ScxCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once teardown is complete
    fn exit(&self, info: &ExitInfo) {}

    /// Pick the CPU a waking task should run on. Direct dispatch from here
    /// skips `enqueue`.
    fn select_cpu(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef, prev_cpu: u32, wake_flags: WakeFlags) -> u32 {
        let (cpu, is_idle) = ctx.select_cpu_dfl(p, prev_cpu, wake_flags);
        if is_idle {
            let slice = ctx.slice_dfl();
            ctx.dispatch(p, SCX_DSQ_LOCAL, slice, EnqFlags::empty());
        }
        cpu
    }

    /// A task became runnable. Dispatch it, or keep it and dispatch later.
    fn enqueue(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef, enq_flags: EnqFlags) {
        let slice = ctx.slice_dfl();
        ctx.dispatch(p, SCX_DSQ_GLOBAL, slice, enq_flags);
    }

    /// A task left the runnable set or is being moved
    fn dequeue(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef, deq_flags: DeqFlags) {}

    /// `cpu` has nothing local to run. `prev` is the task that just stopped,
    /// if any.
    fn dispatch(&self, ctx: &mut ScxCtx<'_>, cpu: u32, prev: Option<&TaskRef>) {}

    fn running(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef) {}

    fn stopping(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef, runnable: bool) {}

    /// Task enters the policy's control
    fn enable(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef) {}

    /// Task leaves the policy's control
    fn disable(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef) {}

    /// Called before the built-in idle tracking is updated
    fn update_idle(&self, ctx: &mut ScxCtx<'_>, cpu: u32, idle: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::const_assert_eq!(SCX_DSQ_INVALID, 0x8000_0000_0000_0000);
    static_assertions::const_assert_eq!(SCX_DSQ_GLOBAL, 0x8000_0000_0000_0001);
    static_assertions::const_assert_eq!(SCX_DSQ_LOCAL_ON, 0xc000_0000_0000_0000);
    static_assertions::assert_obj_safe!(SchedOps);

    #[test]
    fn test_local_on() {
        assert_eq!(dsq_local_on(3) & SCX_DSQ_LOCAL_CPU_MASK, 3);
        assert_eq!(dsq_local_on(3) & SCX_DSQ_LOCAL_ON, SCX_DSQ_LOCAL_ON);
    }

    #[test]
    fn test_dispatch_allowed() {
        assert!(CallbackKind::Enqueue.may_dispatch());
        assert!(!CallbackKind::Running.may_dispatch());
        assert_eq!(CallbackKind::Dispatch.name(), "ops.dispatch()");
    }
}
