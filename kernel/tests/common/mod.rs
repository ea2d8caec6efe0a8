//! Shared policies and helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use exo_sched_ext::{
    EnqFlags, ExitInfo, ExitSink, Result, SchedOps, ScxConfig, ScxCtx, ScxRuntime, TaskRef,
    WakeFlags, SCX_DSQ_GLOBAL,
};

/// User DSQ shared by every CPU
pub const SHARED_DSQ: u64 = 5;

/// Global FIFO: every task goes through the global DSQ, idle wakeups are
/// dispatched straight to the picked CPU
pub struct SimpleFifo;

impl SchedOps for SimpleFifo {
    fn name(&self) -> &str {
        "simple_fifo"
    }

    fn init(&self, ctx: &mut ScxCtx<'_>) -> Result<()> {
        ctx.switch_all();
        Ok(())
    }

    fn enqueue(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef, enq_flags: EnqFlags) {
        let slice = ctx.slice_dfl();
        ctx.dispatch(p, SCX_DSQ_GLOBAL, slice, enq_flags);
    }
}

/// Weighted vtime on [`SHARED_DSQ`]. Records what it sees so tests can
/// check the callback sequence.
#[derive(Default)]
pub struct VtimePolicy {
    pub consumed: Mutex<Vec<bool>>,
    pub running: Mutex<Vec<i32>>,
    pub exits: Mutex<Vec<ExitInfo>>,
}

impl SchedOps for VtimePolicy {
    fn name(&self) -> &str {
        "vtime"
    }

    fn init(&self, ctx: &mut ScxCtx<'_>) -> Result<()> {
        ctx.switch_all();
        ctx.create_dsq(SHARED_DSQ, -1)
    }

    fn exit(&self, info: &ExitInfo) {
        self.exits.lock().unwrap().push(info.clone());
    }

    fn select_cpu(&self, _ctx: &mut ScxCtx<'_>, _p: &TaskRef, prev_cpu: u32, _wake_flags: WakeFlags) -> u32 {
        prev_cpu
    }

    fn enqueue(&self, ctx: &mut ScxCtx<'_>, p: &TaskRef, enq_flags: EnqFlags) {
        let slice = ctx.slice_dfl();
        ctx.dispatch_vtime(p, SHARED_DSQ, slice, p.dsq_vtime(), enq_flags);
    }

    fn dispatch(&self, ctx: &mut ScxCtx<'_>, _cpu: u32, _prev: Option<&TaskRef>) {
        let got = ctx.consume(SHARED_DSQ);
        self.consumed.lock().unwrap().push(got);
    }

    fn running(&self, _ctx: &mut ScxCtx<'_>, p: &TaskRef) {
        self.running.lock().unwrap().push(p.pid());
    }
}

/// Collects exit records
#[derive(Default)]
pub struct ExitLog(pub Mutex<Vec<ExitInfo>>);

impl ExitSink for ExitLog {
    fn on_exit(&self, info: &ExitInfo) {
        self.0.lock().unwrap().push(info.clone());
    }
}

pub fn config(nr_cpus: u32) -> ScxConfig {
    ScxConfig::new().with_nr_cpus(nr_cpus).with_smt_threads(1)
}

/// Enabled runtime with an exit log attached
pub fn enabled(nr_cpus: u32, ops: Arc<dyn SchedOps>) -> (ScxRuntime, Arc<ExitLog>) {
    let rt = ScxRuntime::new(config(nr_cpus), ops).unwrap();
    let log = Arc::new(ExitLog::default());
    rt.set_exit_sink(log.clone());
    rt.enable().unwrap();
    (rt, log)
}
