//! Enable/disable, exit reporting and object lifetimes

mod common;

use std::sync::Arc;

use common::{config, enabled, ExitLog, SimpleFifo};
use exo_sched_ext::{
    scx_error, CallbackKind, Cgroup, EnqFlags, ExitKind, Result, SchedOps, ScxCtx, ScxError,
    ScxRuntime, Task, TaskRef, TaskState, WakeFlags, SCX_DSQ_GLOBAL,
};

struct FailingInit;

impl SchedOps for FailingInit {
    fn name(&self) -> &str {
        "failing_init"
    }

    fn init(&self, ctx: &mut ScxCtx<'_>) -> Result<()> {
        ctx.create_dsq(1, -1)?;
        ctx.create_dsq(1, -1)
    }
}

/// Only schedules tasks that opted in
struct Partial;

impl SchedOps for Partial {
    fn name(&self) -> &str {
        "partial"
    }
}

#[test]
fn test_init_failure_leaves_runtime_disabled() {
    let rt = ScxRuntime::new(config(2), Arc::new(FailingInit)).unwrap();
    let log = Arc::new(ExitLog::default());
    rt.set_exit_sink(log.clone());

    assert_eq!(rt.enable(), Err(ScxError::InitFailed { errno: -17 }));
    assert!(!rt.is_enabled());
    assert!(rt.user_dsq(1).is_none());
    let exits = log.0.lock().unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].kind, ExitKind::Error);
}

#[test]
fn test_reenable_after_disable() {
    let (rt, log) = enabled(2, Arc::new(SimpleFifo));
    rt.add_task(Task::new(1, "t", 2)).unwrap();
    rt.enqueue_task(1, EnqFlags::empty()).unwrap();
    rt.disable().unwrap();
    assert_eq!(rt.global_dsq().nr_queued(), 0);
    assert_eq!(log.0.lock().unwrap()[0].reason, "unregistered from user space");

    rt.enable().unwrap();
    assert!(rt.exit_info().is_none());
    assert_eq!(rt.enqueue_task(1, EnqFlags::empty()), Ok(true));
    assert_eq!(rt.pick_next_task(0).map(|p| p.pid()), Some(1));
}

#[test]
fn test_wake_up_after_reenable_is_scheduled() {
    let (rt, _log) = enabled(2, Arc::new(SimpleFifo));
    let p = rt.add_task(Task::new(1, "t", 2)).unwrap();
    rt.enqueue_task(1, EnqFlags::empty()).unwrap();
    rt.disable().unwrap();
    assert_eq!(p.state(), TaskState::NotQueued);

    rt.enable().unwrap();
    let cpu = rt.wake_up(1, 0, WakeFlags::empty()).unwrap().unwrap();
    assert_eq!(p.state(), TaskState::Queued);
    assert_eq!(rt.pick_next_task(cpu).map(|p| p.pid()), Some(1));
}

#[test]
fn test_bad_width_in_exit_message_is_bounded() {
    let (rt, log) = enabled(1, Arc::new(SimpleFifo));
    rt.with_ctx(0, CallbackKind::Dispatch, |ctx| {
        ctx.exit_bstr(0, "%99999999999999999999d", &[1]);
    });
    rt.update_idle(0, true);

    let exits = log.0.lock().unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].msg.len(), config(1).exit_msg_len);
}

#[test]
fn test_exit_bstr_and_first_exit_wins() {
    let (rt, log) = enabled(1, Arc::new(SimpleFifo));
    rt.with_ctx(0, CallbackKind::Dispatch, |ctx| {
        ctx.exit_bstr(3, "done after %d rounds", &[7]);
        scx_error!(ctx, "late error %x", 0xbeefu32);
    });
    rt.update_idle(0, true);

    let exits = log.0.lock().unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].kind, ExitKind::UnregBpf);
    assert_eq!(exits[0].exit_code, 3);
    assert_eq!(exits[0].msg, "done after 7 rounds");
}

#[test]
fn test_error_bstr_formats_arguments() {
    let (rt, _) = enabled(1, Arc::new(SimpleFifo));
    rt.with_ctx(0, CallbackKind::Enqueue, |ctx| {
        scx_error!(ctx, "bad pid %d on cpu %u (0x%08x)", -4i32, 2u32, 0xabcu64);
    });
    let info = rt.exit_info().unwrap();
    assert_eq!(info.kind, ExitKind::ErrorBpf);
    assert_eq!(info.msg, "bad pid -4 on cpu 2 (0x00000abc)");
}

#[test]
fn test_error_bstr_bad_format_still_exits() {
    let (rt, _) = enabled(1, Arc::new(SimpleFifo));
    rt.with_ctx(0, CallbackKind::Enqueue, |ctx| ctx.error_bstr("%d %d", &[1]));
    let info = rt.exit_info().unwrap();
    assert_eq!(info.kind, ExitKind::ErrorBpf);
    assert_eq!(info.msg, "failed to format error message");
}

#[test]
fn test_dispatch_buffer_overflow() {
    let (rt, _) = enabled(1, Arc::new(SimpleFifo));
    let a = rt.add_task(Task::new(1, "a", 1)).unwrap();
    let b = rt.add_task(Task::new(2, "b", 1)).unwrap();
    rt.with_ctx(0, CallbackKind::Enqueue, |ctx| {
        ctx.dispatch(&a, SCX_DSQ_GLOBAL, 0, EnqFlags::empty());
        ctx.dispatch(&b, SCX_DSQ_GLOBAL, 0, EnqFlags::empty());
    });
    assert!(rt.exit_info().unwrap().msg.contains("overflow"));
}

#[test]
fn test_partial_switch() {
    let (rt, _) = enabled(1, Arc::new(Partial));
    assert!(!rt.is_switched_all());
    rt.add_task(Task::new(1, "host", 1)).unwrap();
    let ext = rt.add_task(Task::new(2, "ext", 1).sched_ext()).unwrap();

    assert_eq!(rt.wake_up(1, 0, WakeFlags::empty()), Ok(None));
    assert_eq!(rt.wake_up(2, 0, WakeFlags::empty()), Ok(Some(0)));
    assert_eq!(ext.state(), TaskState::Queued);
    assert_eq!(rt.enqueue_task(1, EnqFlags::empty()), Ok(false));
}

#[test]
fn test_remove_task_while_queued() {
    let (rt, _) = enabled(1, Arc::new(SimpleFifo));
    let p = rt.add_task(Task::new(9, "gone", 1)).unwrap();
    rt.enqueue_task(9, EnqFlags::empty()).unwrap();
    assert_eq!(rt.add_task(Task::new(9, "dup", 1)).map(|_| ()), Err(ScxError::TaskExists { pid: 9 }));

    rt.remove_task(9).unwrap();
    assert_eq!(rt.global_dsq().nr_queued(), 0);
    assert_eq!(p.state(), TaskState::NotQueued);
    assert!(rt.task(9).is_none());
    assert_eq!(rt.remove_task(9), Err(ScxError::TaskNotFound { pid: 9 }));
    assert!(rt.pick_next_task(0).is_none());
    // The caller's handle outlives the table entry
    assert_eq!(p.refcount(), 1);
}

#[test]
fn test_cgroup_lookup_and_ancestors() {
    let (rt, _) = enabled(1, Arc::new(SimpleFifo));
    let root = rt.add_cgroup(Cgroup::root(1)).unwrap();
    let child = rt.add_cgroup(Cgroup::child(10, root.acquire())).unwrap();
    let p: TaskRef = rt.add_task(Task::new(1, "t", 1).with_cgroup(child.acquire())).unwrap();

    rt.with_ctx(0, CallbackKind::Running, |ctx| {
        let cg = ctx.task_cgroup(&p).unwrap();
        assert_eq!(cg.id(), 10);
        let top = ctx.cgroup_ancestor(&cg, 0).unwrap();
        assert_eq!(top.id(), 1);
        ctx.cgroup_release(top);
        ctx.cgroup_release(cg);
        assert!(ctx.cgroup_from_id(42).is_none());

        let q = ctx.task_from_pid(1).unwrap();
        assert!(TaskRef::ptr_eq(&q, &p));
        ctx.task_release(q);

        let mask = ctx.cpumask_create();
        mask.set_cpu(0);
        let held = ctx.cpumask_acquire(&mask);
        ctx.cpumask_release(mask);
        assert!(held.test_cpu(0));
    });

    rt.remove_cgroup(10).unwrap();
    assert!(rt.cgroup(10).is_none());
    // Still reachable through the task
    assert_eq!(p.cgroup().map(|c| c.level()), Some(1));
    assert_eq!(rt.add_cgroup(Cgroup::root(1)).map(|_| ()), Err(ScxError::CgroupExists { cgid: 1 }));
}
