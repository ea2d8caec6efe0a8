//! sched_ext runtime
//!
//! Glues the primitives together under one [`SchedOps`] policy:
//! - [`ScxRuntime`] owns the DSQs, per-CPU state, idle tracking, object
//!   tables and the exit record, and exposes the host entry points
//!   (`wake_up`, `pick_next_task`, `put_prev_task`, ...).
//! - [`ScxCtx`] is what a policy callback sees: the primitive operations,
//!   bound to the CPU and callback kind it runs for.
//!
//! Every host entry point runs inside an RCU read-side section. A fatal
//! error only records the exit; the next entry point that notices it tears
//! the scheduler down, after a grace period, outside of any callback.
//!
//! Lock order: CPU `curr` -> task -> DSQ. Nothing holds a task or DSQ lock
//! across a policy callback.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use spin::Mutex;

use super::cpumask::{AtomicCpuMask, CpuMask};
use super::dsq::{DestroyOutcome, Dsq, DsqEntry, DsqTable, InsertError};
use super::error::{errno, Result, ScxError};
use super::exit::{format_bstr, ExitInfo, ExitKind, ExitSink, ExitState};
use super::kref::{Handle, ObjectTable};
use super::policy::{
    dsq_local_on, CallbackKind, DeqFlags, EnqFlags, KickFlags, SchedOps, SCX_DSQ_FLAG_BUILTIN,
    SCX_DSQ_GLOBAL, SCX_DSQ_INVALID, SCX_DSQ_LOCAL, SCX_DSQ_LOCAL_CPU_MASK, SCX_DSQ_LOCAL_ON,
    SCX_SLICE_INF,
};
use super::statistics::{ScxStat, ScxStats, StatsSnapshot};
use super::topology::Topology;
use crate::config::ScxConfig;
use crate::libutils::vptr::ResizableArray;
use crate::scheduler::idle::{IdleMaskGuard, IdleTracker, PickIdleFlags, WakeFlags};
use crate::scheduler::thread::{
    Cgroup, CgroupId, Pid, Task, TaskFlags, TaskRef, TaskScx, TaskState,
};
use crate::sync::{Rcu, RcuReadGuard};

/// Rounds of `ops.dispatch()` per pick before giving up
const DSP_MAX_LOOPS: u32 = 32;

/// Set in the kick word whenever a kick is pending, flags or not
const KICK_PENDING: u64 = 1 << 63;

/// Message recorded when a policy error can't be formatted
const BAD_FORMAT_MSG: &str = "failed to format error message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RuntimeState {
    Disabled = 0,
    Enabling = 1,
    Enabled = 2,
    Disabling = 3,
}

/// Per-CPU scheduler state
pub struct ScxCpu {
    cpu: u32,
    local: Dsq,
    curr: Mutex<Option<TaskRef>>,
    /// Task that stopped last, handed to the next `ops.dispatch()`
    prev: Mutex<Option<TaskRef>>,
    kick: AtomicU64,
}

impl ScxCpu {
    fn new(cpu: u32) -> Self {
        Self {
            cpu,
            local: Dsq::new(dsq_local_on(cpu), -1),
            curr: Mutex::new(None),
            prev: Mutex::new(None),
            kick: AtomicU64::new(0),
        }
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Local DSQ
    pub fn local(&self) -> &Dsq {
        &self.local
    }

    /// Task currently running here
    pub fn curr(&self) -> Option<TaskRef> {
        self.curr.lock().as_ref().map(TaskRef::acquire)
    }
}

/// Built-in DSQ borrowed from the runtime, or a user DSQ kept alive by its
/// own reference
enum DsqRef<'a> {
    Builtin(&'a Dsq),
    User(Arc<Dsq>),
}

impl Deref for DsqRef<'_> {
    type Target = Dsq;

    fn deref(&self) -> &Dsq {
        match self {
            Self::Builtin(dsq) => dsq,
            Self::User(dsq) => dsq,
        }
    }
}

/// A dispatch recorded by a callback, applied when the callback returns
struct PendingDispatch {
    task: TaskRef,
    dsq_id: u64,
    slice: u64,
    vtime: Option<u64>,
    flags: EnqFlags,
}

/// The sched_ext runtime
pub struct ScxRuntime {
    config: ScxConfig,
    ops: Arc<dyn SchedOps>,
    state: AtomicU8,
    exit: ExitState,
    exit_sink: Mutex<Option<Arc<dyn ExitSink>>>,
    rcu: Rcu,
    idle: IdleTracker,
    global: Dsq,
    dsqs: DsqTable,
    cpus: ResizableArray<ScxCpu>,
    tasks: ObjectTable<Task>,
    cgroups: ObjectTable<Cgroup>,
    switched_all: AtomicBool,
    stats: ScxStats,
}

impl ScxRuntime {
    pub fn new(config: ScxConfig, ops: Arc<dyn SchedOps>) -> Result<Self> {
        config.validate()?;

        let mut cpus = ResizableArray::new(ScxCpu::new(0));
        cpus.resize_with(config.nr_cpus as usize, |cpu| ScxCpu::new(cpu as u32))?;
        cpus.seal();

        Ok(Self {
            ops,
            state: AtomicU8::new(RuntimeState::Disabled as u8),
            exit: ExitState::new(config.exit_msg_len),
            exit_sink: Mutex::new(None),
            rcu: Rcu::new(),
            idle: IdleTracker::new(Topology::new(config.nr_cpus, config.smt_threads)),
            global: Dsq::new(SCX_DSQ_GLOBAL, -1),
            dsqs: DsqTable::new(config.max_user_dsqs),
            cpus,
            tasks: ObjectTable::new(),
            cgroups: ObjectTable::new(),
            switched_all: AtomicBool::new(false),
            stats: ScxStats::new(),
            config,
        })
    }

    /// Who to tell when the scheduler exits
    pub fn set_exit_sink(&self, sink: Arc<dyn ExitSink>) {
        *self.exit_sink.lock() = Some(sink);
    }

    pub fn config(&self) -> &ScxConfig {
        &self.config
    }

    pub fn nr_cpus(&self) -> u32 {
        self.config.nr_cpus
    }

    pub fn ops_name(&self) -> &str {
        self.ops.name()
    }

    fn state(&self) -> RuntimeState {
        match self.state.load(Ordering::Acquire) {
            0 => RuntimeState::Disabled,
            1 => RuntimeState::Enabling,
            2 => RuntimeState::Enabled,
            _ => RuntimeState::Disabling,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == RuntimeState::Enabled
    }

    pub fn is_switched_all(&self) -> bool {
        self.switched_all.load(Ordering::Relaxed)
    }

    /// The policy schedules this task
    fn manages(&self, p: &Task) -> bool {
        p.is_sched_ext() || self.is_switched_all()
    }

    pub fn cpu(&self, cpu: u32) -> Option<&ScxCpu> {
        self.cpus.get(cpu as usize)
    }

    pub fn idle(&self) -> &IdleTracker {
        &self.idle
    }

    pub fn global_dsq(&self) -> &Dsq {
        &self.global
    }

    pub fn user_dsq(&self, dsq_id: u64) -> Option<Arc<Dsq>> {
        self.dsqs.find(dsq_id)
    }

    pub fn task(&self, pid: Pid) -> Option<TaskRef> {
        self.tasks.get(pid as u64)
    }

    pub fn cgroup(&self, cgid: CgroupId) -> Option<Handle<Cgroup>> {
        self.cgroups.get(cgid)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.info()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.nr_global = self.global.nr_queued() as u64;
        snap.nr_user = self.dsqs.snapshot().iter().map(|d| d.nr_queued() as u64).sum();
        snap
    }

    // ═══════════════════════════════════════════════════════════════
    // Error reporting
    // ═══════════════════════════════════════════════════════════════

    /// Invariant violation detected by the runtime
    fn ops_error(&self, args: fmt::Arguments<'_>) {
        let msg = alloc::fmt::format(args);
        self.exit.record(ExitKind::Error, 0, &msg);
    }

    fn exit_bstr(&self, kind: ExitKind, exit_code: i64, fmt: &str, data: &[u64]) {
        match format_bstr(fmt, data, self.config.exit_msg_len) {
            Ok(msg) => self.exit.record(kind, exit_code, &msg),
            Err(e) => {
                log::warn!("sched_ext: bad error format \"{}\": {}", fmt, e);
                self.exit.record(kind, exit_code, BAD_FORMAT_MSG)
            }
        };
    }

    fn cpu_valid(&self, cpu: u32, what: &str) -> bool {
        if cpu < self.config.nr_cpus {
            return true;
        }
        self.ops_error(format_args!("invalid CPU {} {}", cpu, what));
        false
    }

    // ═══════════════════════════════════════════════════════════════
    // Callbacks
    // ═══════════════════════════════════════════════════════════════

    /// Run `f` as a callback of `kind` on `cpu`. Dispatches it records are
    /// applied when it returns.
    pub fn with_ctx<R>(&self, cpu: u32, kind: CallbackKind, f: impl FnOnce(&mut ScxCtx<'_>) -> R) -> R {
        let mut ctx = ScxCtx::new(self, cpu, kind);
        let ret = f(&mut ctx);
        ctx.flush();
        ret
    }

    fn do_enqueue(&self, cpu: u32, p: &TaskRef, flags: EnqFlags) {
        self.stats.inc(ScxStat::Enqueued);
        self.with_ctx(cpu, CallbackKind::Enqueue, |ctx| self.ops.enqueue(ctx, p, flags));
    }

    fn enable_task(&self, p: &TaskRef) {
        if !self.manages(p) {
            return;
        }
        self.with_ctx(p.cpu(), CallbackKind::Enable, |ctx| self.ops.enable(ctx, p));
        p.scx().flags.insert(TaskFlags::ENABLED);
    }

    fn disable_task(&self, p: &TaskRef) {
        let was_enabled = {
            let mut scx = p.scx();
            let was = scx.flags.contains(TaskFlags::ENABLED);
            scx.flags.remove(TaskFlags::ENABLED);
            was
        };
        if was_enabled {
            self.with_ctx(p.cpu(), CallbackKind::Disable, |ctx| self.ops.disable(ctx, p));
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // DSQ plumbing
    // ═══════════════════════════════════════════════════════════════

    fn lookup_dsq(&self, dsq_id: u64) -> Option<DsqRef<'_>> {
        if dsq_id == SCX_DSQ_GLOBAL {
            return Some(DsqRef::Builtin(&self.global));
        }
        if dsq_id & SCX_DSQ_LOCAL_ON == SCX_DSQ_LOCAL_ON {
            let cpu = (dsq_id & SCX_DSQ_LOCAL_CPU_MASK) as u32;
            return self.cpu(cpu).map(|rq| DsqRef::Builtin(&rq.local));
        }
        if dsq_id & SCX_DSQ_FLAG_BUILTIN != 0 {
            return None;
        }
        self.dsqs.find(dsq_id).map(DsqRef::User)
    }

    /// Target DSQ of a dispatch, and the CPU when it is a local DSQ. Unusable
    /// targets fall back to the global DSQ.
    fn resolve_dispatch(&self, dsq_id: u64, local_cpu: u32, p: &Task) -> (DsqRef<'_>, Option<u32>) {
        let cpu = if dsq_id == SCX_DSQ_LOCAL {
            Some(local_cpu)
        } else if dsq_id & SCX_DSQ_LOCAL_ON == SCX_DSQ_LOCAL_ON {
            let cpu = (dsq_id & SCX_DSQ_LOCAL_CPU_MASK) as u32;
            if !self.cpu_valid(cpu, "in SCX_DSQ_LOCAL_ON dispatch verdict") {
                self.stats.inc(ScxStat::FallbackGlobal);
                return (DsqRef::Builtin(&self.global), None);
            }
            Some(cpu)
        } else {
            None
        };

        if let Some(cpu) = cpu {
            if let Some(rq) = self.cpu(cpu).filter(|_| p.cpus_allowed().test_cpu(cpu)) {
                return (DsqRef::Builtin(&rq.local), Some(cpu));
            }
            log::trace!("sched_ext: {}[{}] not allowed on cpu {}, using global", p.comm(), p.pid(), cpu);
            self.stats.inc(ScxStat::FallbackGlobal);
            return (DsqRef::Builtin(&self.global), None);
        }

        if dsq_id == SCX_DSQ_GLOBAL {
            return (DsqRef::Builtin(&self.global), None);
        }
        if dsq_id & SCX_DSQ_FLAG_BUILTIN == 0 {
            if let Some(dsq) = self.dsqs.find(dsq_id) {
                return (DsqRef::User(dsq), None);
            }
        }

        self.ops_error(format_args!("non-existent DSQ 0x{:x} for {}[{}]", dsq_id, p.comm(), p.pid()));
        self.stats.inc(ScxStat::FallbackGlobal);
        (DsqRef::Builtin(&self.global), None)
    }

    /// Queue `entry` on `dsq`. Returns the id of the DSQ it ended up on.
    fn insert_entry(&self, dsq: &Dsq, entry: DsqEntry, vtime: bool, head: bool) -> u64 {
        let res = if vtime && dsq.is_builtin() {
            self.ops_error(format_args!("cannot use vtime ordering for built-in DSQs"));
            dsq.insert_fifo(entry, head)
        } else if vtime {
            dsq.insert_vtime(entry)
        } else {
            dsq.insert_fifo(entry, head)
        };

        let err = match res {
            Ok(()) => return dsq.id(),
            Err(e) => e,
        };
        match &err {
            InsertError::Dead(_) => self.ops_error(format_args!("non-existent DSQ 0x{:x}", dsq.id())),
            InsertError::HasPriq(_) => {
                self.ops_error(format_args!("DSQ 0x{:x} already had PRIQ-enqueued tasks", dsq.id()))
            }
            InsertError::HasFifo(_) => {
                self.ops_error(format_args!("DSQ 0x{:x} already had FIFO-enqueued tasks", dsq.id()))
            }
        }
        self.stats.inc(ScxStat::FallbackGlobal);
        if self.global.insert_fifo(err.into_entry(), false).is_err() {
            log::error!("sched_ext: global DSQ refused a task");
        }
        SCX_DSQ_GLOBAL
    }

    /// Take a queued task off its DSQ. Called with the task lock held.
    fn unlink(&self, p: &TaskRef, scx: &mut TaskScx) {
        if let Some(dsq) = self.lookup_dsq(scx.dsq_id) {
            // Already popped by a consumer that hasn't validated it yet
            // when this fails; it will find the seq bumped.
            dsq.remove(p, scx.seq, scx.dsq_vtime);
        }
        scx.transition(TaskState::NotQueued);
        scx.dsq_id = SCX_DSQ_INVALID;
        scx.seq += 1;
    }

    /// Apply one recorded dispatch. `dispatch_cpu` is the CPU `SCX_DSQ_LOCAL`
    /// means, `None` for the task's own CPU.
    fn finish_dispatch(&self, d: PendingDispatch, dispatch_cpu: Option<u32>) -> bool {
        let p = &d.task;
        let mut scx = p.scx();

        if !scx.flags.contains(TaskFlags::RUNNABLE) || scx.state == TaskState::Running {
            drop(scx);
            log::trace!("sched_ext: ignoring dispatch of {}[{}]", p.comm(), p.pid());
            self.stats.inc(ScxStat::DispatchIgnored);
            return false;
        }

        let local_cpu = dispatch_cpu.unwrap_or(scx.cpu);
        let (dsq, on_cpu) = self.resolve_dispatch(d.dsq_id, local_cpu, p);

        if scx.state == TaskState::Queued {
            self.unlink(p, &mut scx);
        }
        if d.slice != 0 {
            scx.slice = d.slice;
        } else if scx.slice == 0 {
            scx.slice = self.config.slice_dfl_ns;
        }
        if let Some(vtime) = d.vtime {
            scx.dsq_vtime = vtime;
        }
        scx.seq += 1;

        let entry = DsqEntry { task: p.acquire(), vtime: scx.dsq_vtime, seq: scx.seq };
        let placed = self.insert_entry(&dsq, entry, d.vtime.is_some(), d.flags.contains(EnqFlags::HEAD));
        scx.transition(TaskState::Queued);
        scx.dsq_id = placed;
        let on_cpu = on_cpu.filter(|_| placed != SCX_DSQ_GLOBAL);
        if let Some(cpu) = on_cpu {
            scx.cpu = cpu;
        }
        drop(scx);

        log::trace!("sched_ext: {}[{}] -> dsq 0x{:x}", p.comm(), p.pid(), placed);
        self.stats.inc(ScxStat::Dispatched);
        if let Some(cpu) = on_cpu {
            self.stats.inc(ScxStat::DispatchedLocal);
            if d.flags.contains(EnqFlags::PREEMPT) {
                self.kick(cpu, KickFlags::PREEMPT);
            } else if Some(cpu) != dispatch_cpu {
                self.kick(cpu, KickFlags::empty());
            }
        }
        true
    }

    /// Move the first task of `dsq` that may run on `cpu` to its local DSQ
    fn consume_to_local(&self, dsq: &Dsq, cpu: u32) -> bool {
        let Some(rq) = self.cpu(cpu) else {
            return false;
        };

        while let Some(entry) = dsq.pop_first_where(|e| e.task.cpus_allowed().test_cpu(cpu)) {
            let DsqEntry { task: p, seq, .. } = entry;
            let mut scx = p.scx();
            if scx.seq != seq || scx.state != TaskState::Queued || scx.dsq_id != dsq.id() {
                self.stats.inc(ScxStat::Stale);
                continue;
            }

            scx.seq += 1;
            let local = DsqEntry { task: p.acquire(), vtime: scx.dsq_vtime, seq: scx.seq };
            if rq.local.insert_fifo(local, false).is_err() {
                log::error!("sched_ext: local DSQ of cpu {} refused a task", cpu);
                scx.transition(TaskState::NotQueued);
                scx.dsq_id = SCX_DSQ_INVALID;
                return false;
            }
            scx.dsq_id = rq.local.id();
            scx.cpu = cpu;
            drop(scx);

            self.stats.inc(ScxStat::Consumed);
            return true;
        }
        false
    }

    /// Pop the head of `cpu`'s local DSQ and mark it running
    fn pick_from_local(&self, cpu: u32) -> Option<TaskRef> {
        let rq = self.cpu(cpu)?;
        while let Some(entry) = rq.local.pop_first() {
            let DsqEntry { task: p, seq, .. } = entry;
            let mut scx = p.scx();
            if scx.seq != seq || scx.state != TaskState::Queued {
                self.stats.inc(ScxStat::Stale);
                continue;
            }
            scx.transition(TaskState::Running);
            scx.dsq_id = SCX_DSQ_INVALID;
            scx.seq += 1;
            scx.cpu = cpu;
            drop(scx);
            return Some(p);
        }
        None
    }

    fn pick_local_or_global(&self, cpu: u32) -> Option<TaskRef> {
        if let Some(p) = self.pick_from_local(cpu) {
            return Some(p);
        }
        if self.consume_to_local(&self.global, cpu) {
            return self.pick_from_local(cpu);
        }
        None
    }

    /// One `ops.dispatch()` round. Returns the number of dispatches applied.
    fn dispatch_round(&self, cpu: u32, prev: Option<&TaskRef>) -> u32 {
        self.stats.inc(ScxStat::DispatchCalls);
        let mut ctx = ScxCtx::new(self, cpu, CallbackKind::Dispatch);
        self.ops.dispatch(&mut ctx, cpu, prev);
        ctx.flush();
        ctx.nr_applied
    }

    fn kick(&self, cpu: u32, flags: KickFlags) {
        let Some(rq) = self.cpu(cpu) else {
            return;
        };
        if flags.contains(KickFlags::IDLE) && !self.idle.is_idle(cpu) {
            return;
        }
        if flags.contains(KickFlags::PREEMPT) {
            if let Some(curr) = rq.curr.lock().as_ref() {
                curr.scx().slice = 0;
            }
        }
        rq.kick.fetch_or(flags.bits() | KICK_PENDING, Ordering::Relaxed);
        self.stats.inc(ScxStat::Kicks);
    }

    // ═══════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════

    /// Enter a host entry point. `None` when no scheduler is enabled, in
    /// which case the host schedules on its own. Performs pending teardown.
    fn begin(&self) -> Option<RcuReadGuard<'_>> {
        if self.state() != RuntimeState::Enabled {
            return None;
        }
        if self.exit.pending() {
            self.teardown();
            return None;
        }
        let guard = self.rcu.read_lock();
        // Teardown may have started between the check and the lock
        if self.state() != RuntimeState::Enabled {
            return None;
        }
        Some(guard)
    }

    /// Attach the policy
    pub fn enable(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                RuntimeState::Disabled as u8,
                RuntimeState::Enabling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ScxError::AlreadyEnabled);
        }

        self.exit.reset();
        self.stats.reset();
        self.idle.reset();
        self.switched_all.store(false, Ordering::Relaxed);

        let res = self.with_ctx(0, CallbackKind::Init, |ctx| self.ops.init(ctx));
        let err = match res {
            Err(e) => Some(e.errno()),
            Ok(()) if self.exit.pending() => Some(-errno::EINVAL),
            Ok(()) => None,
        };
        if let Some(errno) = err {
            log::warn!("sched_ext: \"{}\" failed to initialize ({})", self.ops.name(), errno);
            self.exit.record(ExitKind::Error, errno as i64, "ops.init() failed");
            self.state.store(RuntimeState::Enabled as u8, Ordering::Release);
            self.teardown();
            return Err(ScxError::InitFailed { errno });
        }

        self.state.store(RuntimeState::Enabled as u8, Ordering::Release);
        for p in self.tasks.snapshot() {
            self.enable_task(&p);
        }
        log::info!("sched_ext: BPF scheduler \"{}\" enabled", self.ops.name());
        Ok(())
    }

    /// Detach the policy now
    pub fn disable(&self) -> Result<()> {
        if self.state() != RuntimeState::Enabled {
            return Err(ScxError::NotEnabled);
        }
        self.exit.record(ExitKind::Unreg, 0, "");
        self.teardown();
        Ok(())
    }

    fn teardown(&self) {
        if self
            .state
            .compare_exchange(
                RuntimeState::Enabled as u8,
                RuntimeState::Disabling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.rcu.synchronize();

        let info = self.exit.info().unwrap_or(ExitInfo {
            kind: ExitKind::Done,
            exit_code: 0,
            reason: ExitKind::Done.reason(),
            msg: String::new(),
        });

        // Every queued task goes back to the host
        let mut entries = self.global.drain();
        for rq in self.cpus.iter() {
            entries.extend(rq.local.drain());
            if let Some(p) = rq.curr.lock().take() {
                let mut scx = p.scx();
                scx.state = TaskState::NotQueued;
                scx.seq += 1;
            }
            rq.prev.lock().take();
            rq.kick.store(0, Ordering::Relaxed);
        }
        for dsq in self.dsqs.clear() {
            entries.extend(dsq.drain());
        }
        for entry in entries {
            let mut scx = entry.task.scx();
            if scx.seq == entry.seq && scx.state == TaskState::Queued {
                scx.transition(TaskState::NotQueued);
                scx.dsq_id = SCX_DSQ_INVALID;
                scx.seq += 1;
            }
        }

        // The host owns runnability while detached and hands tasks back with
        // wake_up() or enqueue_task() after the next enable
        for p in self.tasks.snapshot() {
            p.scx().flags.remove(TaskFlags::RUNNABLE | TaskFlags::DEQD_FOR_SLEEP);
            self.disable_task(&p);
        }

        self.ops.exit(&info);
        if let Some(sink) = self.exit_sink.lock().clone() {
            sink.on_exit(&info);
        }
        self.state.store(RuntimeState::Disabled as u8, Ordering::Release);
        log::info!("sched_ext: BPF scheduler \"{}\" disabled ({})", self.ops.name(), info.reason);
    }

    // ═══════════════════════════════════════════════════════════════
    // Host entry points
    // ═══════════════════════════════════════════════════════════════

    /// Register a task
    pub fn add_task(&self, task: Task) -> Result<TaskRef> {
        let pid = task.pid();
        let cpu = task.cpu();
        if cpu >= self.config.nr_cpus {
            return Err(ScxError::InvalidCpu { cpu, nr_cpus: self.config.nr_cpus });
        }
        let obj = Arc::new(task);
        if !self.tasks.insert(pid as u64, obj.clone()) {
            return Err(ScxError::TaskExists { pid });
        }
        let p = Handle::from_arc(obj);
        if let Some(_guard) = self.begin() {
            self.enable_task(&p);
        }
        log::trace!("sched_ext: task {}[{}] added", p.comm(), pid);
        Ok(p)
    }

    /// Unregister a task, taking it off any DSQ and CPU
    pub fn remove_task(&self, pid: Pid) -> Result<()> {
        let p = self.tasks.get(pid as u64).ok_or(ScxError::TaskNotFound { pid })?;
        let guard = self.begin();

        for rq in self.cpus.iter() {
            let mut curr = rq.curr.lock();
            if curr.as_ref().is_some_and(|c| TaskRef::ptr_eq(c, &p)) {
                *curr = None;
            }
            drop(curr);
            let mut prev = rq.prev.lock();
            if prev.as_ref().is_some_and(|c| TaskRef::ptr_eq(c, &p)) {
                *prev = None;
            }
        }
        {
            let mut scx = p.scx();
            if scx.state == TaskState::Queued {
                self.unlink(&p, &mut scx);
            }
            scx.state = TaskState::NotQueued;
            scx.flags.remove(TaskFlags::RUNNABLE);
        }
        if guard.is_some() {
            self.disable_task(&p);
        }
        drop(guard);

        self.tasks.remove(pid as u64);
        log::trace!("sched_ext: task {}[{}] removed", p.comm(), pid);
        Ok(())
    }

    pub fn add_cgroup(&self, cgrp: Cgroup) -> Result<Handle<Cgroup>> {
        let cgid = cgrp.id();
        let obj = Arc::new(cgrp);
        if !self.cgroups.insert(cgid, obj.clone()) {
            return Err(ScxError::CgroupExists { cgid });
        }
        Ok(Handle::from_arc(obj))
    }

    /// Unpublish a cgroup. Existing handles stay valid.
    pub fn remove_cgroup(&self, cgid: CgroupId) -> Result<()> {
        self.cgroups.remove(cgid).map(drop).ok_or(ScxError::CgroupNotFound { cgid })
    }

    /// A sleeping task wakes up on `waker_cpu`. Returns the CPU it was placed
    /// on, or `None` if the policy doesn't schedule it.
    pub fn wake_up(&self, pid: Pid, waker_cpu: u32, wake_flags: WakeFlags) -> Result<Option<u32>> {
        let p = self.tasks.get(pid as u64).ok_or(ScxError::TaskNotFound { pid })?;
        if waker_cpu >= self.config.nr_cpus {
            return Err(ScxError::InvalidCpu { cpu: waker_cpu, nr_cpus: self.config.nr_cpus });
        }
        let Some(_guard) = self.begin() else {
            return Err(ScxError::NotEnabled);
        };
        if !self.manages(&p) {
            return Ok(None);
        }

        let prev_cpu = {
            let mut scx = p.scx();
            if scx.flags.contains(TaskFlags::RUNNABLE) {
                return Ok(Some(scx.cpu));
            }
            scx.flags.insert(TaskFlags::RUNNABLE);
            scx.flags.remove(TaskFlags::DEQD_FOR_SLEEP);
            scx.cpu
        };

        let mut ctx = ScxCtx::new(self, waker_cpu, CallbackKind::SelectCpu);
        let mut cpu = self.ops.select_cpu(&mut ctx, &p, prev_cpu, wake_flags);
        if !self.cpu_valid(cpu, "from ops.select_cpu()") {
            cpu = prev_cpu;
        }
        p.scx().cpu = cpu;
        let direct = !ctx.buf.is_empty();
        ctx.flush();
        drop(ctx);

        if !direct {
            self.do_enqueue(cpu, &p, EnqFlags::WAKEUP);
        }
        Ok(Some(cpu))
    }

    /// Make a task runnable without a wakeup, e.g. right after creation
    pub fn enqueue_task(&self, pid: Pid, enq_flags: EnqFlags) -> Result<bool> {
        let p = self.tasks.get(pid as u64).ok_or(ScxError::TaskNotFound { pid })?;
        let Some(_guard) = self.begin() else {
            return Err(ScxError::NotEnabled);
        };
        if !self.manages(&p) {
            return Ok(false);
        }
        let cpu = {
            let mut scx = p.scx();
            scx.flags.insert(TaskFlags::RUNNABLE);
            scx.cpu
        };
        self.do_enqueue(cpu, &p, enq_flags);
        Ok(true)
    }

    /// Take a task off the runnable set
    pub fn dequeue_task(&self, pid: Pid, deq_flags: DeqFlags) -> Result<()> {
        let p = self.tasks.get(pid as u64).ok_or(ScxError::TaskNotFound { pid })?;
        let Some(_guard) = self.begin() else {
            return Err(ScxError::NotEnabled);
        };
        if !self.manages(&p) {
            return Ok(());
        }

        let cpu = {
            let mut scx = p.scx();
            if !scx.flags.contains(TaskFlags::RUNNABLE) {
                return Ok(());
            }
            if scx.state == TaskState::Queued {
                self.unlink(&p, &mut scx);
            }
            scx.flags.remove(TaskFlags::RUNNABLE);
            if deq_flags.contains(DeqFlags::SLEEP) {
                scx.flags.insert(TaskFlags::DEQD_FOR_SLEEP);
            }
            scx.cpu
        };
        self.stats.inc(ScxStat::Dequeued);
        self.with_ctx(cpu, CallbackKind::Dequeue, |ctx| self.ops.dequeue(ctx, &p, deq_flags));
        Ok(())
    }

    /// Pick the next task for `cpu`: its local DSQ, then the global DSQ, then
    /// whatever `ops.dispatch()` provides. `None` means the CPU goes idle.
    pub fn pick_next_task(&self, cpu: u32) -> Option<TaskRef> {
        let _guard = self.begin()?;
        let rq = self.cpu(cpu)?;

        if rq.curr.lock().is_some() {
            self.put_prev_inner(rq, true);
        }
        let prev = rq.prev.lock().take();

        let mut picked = self.pick_local_or_global(cpu);
        let mut loops = 0;
        while picked.is_none() && loops < DSP_MAX_LOOPS && !self.exit.pending() {
            loops += 1;
            let nr = self.dispatch_round(cpu, prev.as_ref());
            picked = self.pick_local_or_global(cpu);
            if nr == 0 {
                break;
            }
        }

        let Some(p) = picked else {
            self.stats.inc(ScxStat::IdlePicks);
            self.update_idle_inner(cpu, true);
            return None;
        };

        *rq.curr.lock() = Some(p.acquire());
        if self.idle.is_idle(cpu) {
            self.update_idle_inner(cpu, false);
        }
        self.stats.inc(ScxStat::Picked);
        self.with_ctx(cpu, CallbackKind::Running, |ctx| self.ops.running(ctx, &p));
        Some(p)
    }

    /// The current task of `cpu` stops running. A `runnable` task with slice
    /// left goes back to the head of the local DSQ, otherwise to
    /// `ops.enqueue()`.
    pub fn put_prev_task(&self, cpu: u32, runnable: bool) {
        let Some(_guard) = self.begin() else {
            return;
        };
        if let Some(rq) = self.cpu(cpu) {
            self.put_prev_inner(rq, runnable);
        }
    }

    fn put_prev_inner(&self, rq: &ScxCpu, runnable: bool) {
        let Some(p) = rq.curr.lock().take() else {
            return;
        };
        let cpu = rq.cpu;
        self.with_ctx(cpu, CallbackKind::Stopping, |ctx| self.ops.stopping(ctx, &p, runnable));

        let slice = {
            let mut scx = p.scx();
            if scx.state == TaskState::Running {
                scx.transition(TaskState::NotQueued);
                scx.seq += 1;
            }
            if !runnable {
                scx.flags.remove(TaskFlags::RUNNABLE);
                scx.flags.insert(TaskFlags::DEQD_FOR_SLEEP);
            }
            scx.slice
        };

        if runnable && p.scx().flags.contains(TaskFlags::RUNNABLE) {
            if slice > 0 {
                let d = PendingDispatch {
                    task: p.acquire(),
                    dsq_id: dsq_local_on(cpu),
                    slice,
                    vtime: None,
                    flags: EnqFlags::HEAD,
                };
                self.finish_dispatch(d, Some(cpu));
            } else {
                self.do_enqueue(cpu, &p, EnqFlags::empty());
            }
        }
        *rq.prev.lock() = Some(p);
    }

    /// Account `elapsed_ns` to the current task of `cpu`. Returns true when
    /// its slice is used up and the CPU should reschedule.
    pub fn tick(&self, cpu: u32, elapsed_ns: u64) -> bool {
        let Some(_guard) = self.begin() else {
            return false;
        };
        let Some(rq) = self.cpu(cpu) else {
            return false;
        };
        let curr = rq.curr.lock();
        let Some(p) = curr.as_ref() else {
            return false;
        };
        let mut scx = p.scx();
        if scx.slice != SCX_SLICE_INF {
            scx.slice = scx.slice.saturating_sub(elapsed_ns);
        }
        scx.slice == 0
    }

    /// `cpu` enters or leaves idle
    pub fn update_idle(&self, cpu: u32, idle: bool) {
        let Some(_guard) = self.begin() else {
            return;
        };
        self.update_idle_inner(cpu, idle);
    }

    fn update_idle_inner(&self, cpu: u32, idle: bool) {
        if cpu >= self.config.nr_cpus {
            return;
        }
        self.with_ctx(cpu, CallbackKind::UpdateIdle, |ctx| self.ops.update_idle(ctx, cpu, idle));
        self.idle.update(cpu, idle);
    }

    /// Collect the pending kick of `cpu`, if any
    pub fn take_kick(&self, cpu: u32) -> Option<KickFlags> {
        let rq = self.cpu(cpu)?;
        let v = rq.kick.swap(0, Ordering::Relaxed);
        if v & KICK_PENDING == 0 {
            return None;
        }
        Some(KickFlags::from_bits_truncate(v & !KICK_PENDING))
    }
}

/// Context of one policy callback
pub struct ScxCtx<'a> {
    rt: &'a ScxRuntime,
    cpu: u32,
    kind: CallbackKind,
    buf: Vec<PendingDispatch>,
    nr_slots: usize,
    nr_applied: u32,
    _rcu: RcuReadGuard<'a>,
}

impl<'a> ScxCtx<'a> {
    fn new(rt: &'a ScxRuntime, cpu: u32, kind: CallbackKind) -> Self {
        let nr_slots = match kind {
            CallbackKind::Dispatch => rt.config.dispatch_max_batch as usize,
            _ => 1,
        };
        Self {
            rt,
            cpu,
            kind,
            buf: Vec::with_capacity(nr_slots),
            nr_slots,
            nr_applied: 0,
            _rcu: rt.rcu.read_lock(),
        }
    }

    /// CPU the callback runs for
    #[inline]
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    #[inline]
    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub fn nr_cpu_ids(&self) -> u32 {
        self.rt.config.nr_cpus
    }

    pub fn slice_dfl(&self) -> u64 {
        self.rt.config.slice_dfl_ns
    }

    fn allowed(&self, what: &str, ok: bool) -> bool {
        if !ok {
            self.rt.ops_error(format_args!("{} called from {}", what, self.kind.name()));
        }
        ok
    }

    fn flush(&mut self) {
        let dispatch_cpu = (self.kind == CallbackKind::Dispatch).then_some(self.cpu);
        for d in core::mem::take(&mut self.buf) {
            if self.rt.finish_dispatch(d, dispatch_cpu) {
                self.nr_applied += 1;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════

    fn push_dispatch(&mut self, p: &TaskRef, dsq_id: u64, slice: u64, vtime: Option<u64>, flags: EnqFlags) {
        if !self.allowed("dispatch", self.kind.may_dispatch()) {
            return;
        }
        if self.buf.len() >= self.nr_slots {
            self.rt.ops_error(format_args!("dispatch buffer overflow"));
            return;
        }
        self.buf.push(PendingDispatch { task: p.acquire(), dsq_id, slice, vtime, flags });
    }

    /// Queue `p` on `dsq_id` in FIFO order. A zero `slice` keeps the task's
    /// current slice, or gives it the default one.
    pub fn dispatch(&mut self, p: &TaskRef, dsq_id: u64, slice: u64, enq_flags: EnqFlags) {
        self.push_dispatch(p, dsq_id, slice, None, enq_flags);
    }

    /// Queue `p` on `dsq_id` ordered by `vtime`
    pub fn dispatch_vtime(&mut self, p: &TaskRef, dsq_id: u64, slice: u64, vtime: u64, enq_flags: EnqFlags) {
        self.push_dispatch(p, dsq_id, slice, Some(vtime), enq_flags);
    }

    /// Dispatch buffer slots left
    pub fn dispatch_nr_slots(&self) -> u32 {
        if !self.allowed("dispatch_nr_slots", self.kind == CallbackKind::Dispatch) {
            return 0;
        }
        (self.nr_slots - self.buf.len()) as u32
    }

    /// Drop the latest dispatch of this callback
    pub fn dispatch_cancel(&mut self) {
        if !self.allowed("dispatch_cancel", self.kind == CallbackKind::Dispatch) {
            return;
        }
        self.buf.pop();
    }

    /// Move the head of `dsq_id` to this CPU's local DSQ. Pending dispatches
    /// are applied first.
    pub fn consume(&mut self, dsq_id: u64) -> bool {
        if !self.allowed("consume", self.kind == CallbackKind::Dispatch) {
            return false;
        }
        self.flush();

        let dsq = if dsq_id == SCX_DSQ_GLOBAL {
            Some(DsqRef::Builtin(&self.rt.global))
        } else if dsq_id & SCX_DSQ_FLAG_BUILTIN == 0 {
            self.rt.dsqs.find(dsq_id).map(DsqRef::User)
        } else {
            None
        };
        let Some(dsq) = dsq else {
            self.rt.ops_error(format_args!("invalid DSQ ID 0x{:016x}", dsq_id));
            return false;
        };

        let moved = self.rt.consume_to_local(&dsq, self.cpu);
        if moved {
            self.nr_applied += 1;
        }
        moved
    }

    /// Take every task off this CPU's local DSQ and run it through
    /// `ops.enqueue()` again
    pub fn reenqueue_local(&mut self) -> u32 {
        let ok = !matches!(self.kind, CallbackKind::SelectCpu | CallbackKind::Enqueue);
        if !self.allowed("reenqueue_local", ok) {
            return 0;
        }
        self.flush();
        let Some(rq) = self.rt.cpu(self.cpu) else {
            return 0;
        };

        let mut nr = 0;
        for entry in rq.local.drain() {
            let DsqEntry { task: p, seq, .. } = entry;
            {
                let mut scx = p.scx();
                if scx.seq != seq || scx.state != TaskState::Queued {
                    self.rt.stats.inc(ScxStat::Stale);
                    continue;
                }
                scx.transition(TaskState::NotQueued);
                scx.dsq_id = SCX_DSQ_INVALID;
                scx.seq += 1;
            }
            self.rt.do_enqueue(self.cpu, &p, EnqFlags::REENQ);
            nr += 1;
        }
        self.rt.stats.add(ScxStat::Reenqueued, nr as u64);
        nr
    }

    /// Make `cpu` go through the scheduling path soon
    pub fn kick_cpu(&self, cpu: u32, flags: KickFlags) {
        if self.rt.cpu_valid(cpu, "passed to kick_cpu()") {
            self.rt.kick(cpu, flags);
        }
    }

    /// Racy length of a DSQ, `-ENOENT` if there is no such DSQ
    pub fn dsq_nr_queued(&self, dsq_id: u64) -> i32 {
        let id = if dsq_id == SCX_DSQ_LOCAL { dsq_local_on(self.cpu) } else { dsq_id };
        match self.rt.lookup_dsq(id) {
            Some(dsq) => dsq.nr_queued() as i32,
            None => -errno::ENOENT,
        }
    }

    pub fn create_dsq(&self, dsq_id: u64, node: i32) -> Result<()> {
        match self.rt.dsqs.create(dsq_id, node) {
            Ok(_) => {
                log::debug!("sched_ext: created DSQ 0x{:x} (node {})", dsq_id, node);
                Ok(())
            }
            Err(e) => {
                log::warn!("sched_ext: create_dsq: {}", e);
                Err(e)
            }
        }
    }

    /// Destroy a user DSQ. Destroying one that still has tasks queued is
    /// fatal.
    pub fn destroy_dsq(&self, dsq_id: u64) -> Result<()> {
        if dsq_id & SCX_DSQ_FLAG_BUILTIN != 0 {
            return Err(ScxError::DsqBuiltin { dsq_id });
        }
        match self.rt.dsqs.destroy(dsq_id) {
            DestroyOutcome::Destroyed => {
                log::debug!("sched_ext: destroyed DSQ 0x{:x}", dsq_id);
                Ok(())
            }
            DestroyOutcome::NotFound => Err(ScxError::DsqNotFound { dsq_id }),
            DestroyOutcome::Busy { nr } => {
                self.rt.ops_error(format_args!(
                    "attempting to destroy in-use dsq 0x{:016x} (nr={})",
                    dsq_id, nr
                ));
                Err(ScxError::Busy { operation: "destroy_dsq" })
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Tasks, cgroups and cpumasks
    // ═══════════════════════════════════════════════════════════════

    pub fn task_running(&self, p: &TaskRef) -> bool {
        p.state() == TaskState::Running
    }

    pub fn task_cpu(&self, p: &TaskRef) -> u32 {
        p.cpu()
    }

    pub fn task_cgroup(&self, p: &TaskRef) -> Option<Handle<Cgroup>> {
        p.cgroup()
    }

    pub fn task_from_pid(&self, pid: Pid) -> Option<TaskRef> {
        self.rt.tasks.get(pid as u64)
    }

    pub fn task_acquire(&self, p: &TaskRef) -> TaskRef {
        p.acquire()
    }

    pub fn task_release(&self, p: TaskRef) {
        p.release();
    }

    pub fn cgroup_from_id(&self, cgid: CgroupId) -> Option<Handle<Cgroup>> {
        self.rt.cgroups.get(cgid)
    }

    pub fn cgroup_ancestor(&self, cgrp: &Handle<Cgroup>, level: u32) -> Option<Handle<Cgroup>> {
        Cgroup::ancestor(cgrp, level)
    }

    pub fn cgroup_release(&self, cgrp: Handle<Cgroup>) {
        cgrp.release();
    }

    /// Empty mask owned by the caller
    pub fn cpumask_create(&self) -> Handle<AtomicCpuMask> {
        Handle::new(AtomicCpuMask::new(self.rt.config.nr_cpus))
    }

    pub fn cpumask_acquire(&self, mask: &Handle<AtomicCpuMask>) -> Handle<AtomicCpuMask> {
        mask.acquire()
    }

    pub fn cpumask_release(&self, mask: Handle<AtomicCpuMask>) {
        mask.release();
    }

    // ═══════════════════════════════════════════════════════════════
    // Idle
    // ═══════════════════════════════════════════════════════════════

    pub fn get_idle_cpumask(&self) -> IdleMaskGuard<'a> {
        self.rt.idle.get_idle_cpumask()
    }

    pub fn get_idle_smtmask(&self) -> IdleMaskGuard<'a> {
        self.rt.idle.get_idle_smtmask()
    }

    pub fn put_idle_cpumask(&self, mask: IdleMaskGuard<'_>) {
        self.rt.idle.put_idle_cpumask(mask);
    }

    pub fn test_and_clear_cpu_idle(&self, cpu: u32) -> bool {
        self.rt.cpu_valid(cpu, "passed to test_and_clear_cpu_idle()")
            && self.rt.idle.test_and_clear_cpu_idle(cpu)
    }

    pub fn pick_idle_cpu(&self, allowed: &CpuMask, flags: PickIdleFlags) -> Option<u32> {
        self.rt.idle.pick_idle_cpu(allowed, flags)
    }

    pub fn pick_any_cpu(&self, allowed: &CpuMask, flags: PickIdleFlags) -> Option<u32> {
        self.rt.idle.pick_any_cpu(allowed, flags)
    }

    /// Default CPU selection. Returns the CPU and whether it was idle.
    pub fn select_cpu_dfl(&self, p: &TaskRef, prev_cpu: u32, wake_flags: WakeFlags) -> (u32, bool) {
        let ok = matches!(self.kind, CallbackKind::SelectCpu | CallbackKind::Enqueue);
        if !self.allowed("select_cpu_dfl", ok) {
            return (prev_cpu, false);
        }
        let waker = Some(self.cpu).filter(|&c| self.rt.cpu(c).is_some_and(|rq| rq.local.nr_queued() == 0));
        self.rt.idle.select_cpu_dfl(p, prev_cpu, wake_flags, waker)
    }

    // ═══════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════

    /// Schedule every registered task, not only the ones that opted in
    pub fn switch_all(&self) {
        if self.allowed("switch_all", self.kind == CallbackKind::Init) {
            self.rt.switched_all.store(true, Ordering::Relaxed);
            log::debug!("sched_ext: switching all tasks");
        }
    }

    /// Report a fatal error: `fmt` rendered against `data`
    pub fn error_bstr(&self, fmt: &str, data: &[u64]) {
        self.rt.exit_bstr(ExitKind::ErrorBpf, 0, fmt, data);
    }

    /// Request a clean detach with `exit_code`
    pub fn exit_bstr(&self, exit_code: i64, fmt: &str, data: &[u64]) {
        self.rt.exit_bstr(ExitKind::UnregBpf, exit_code, fmt, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::core::policy::SCX_SLICE_DFL;

    struct Fifo;

    impl SchedOps for Fifo {
        fn name(&self) -> &str {
            "fifo"
        }

        fn init(&self, ctx: &mut ScxCtx<'_>) -> Result<()> {
            ctx.switch_all();
            Ok(())
        }
    }

    fn runtime(nr_cpus: u32) -> ScxRuntime {
        let config = ScxConfig::new().with_nr_cpus(nr_cpus).with_smt_threads(1);
        ScxRuntime::new(config, Arc::new(Fifo)).unwrap()
    }

    #[test]
    fn test_enable_twice() {
        let rt = runtime(2);
        rt.enable().unwrap();
        assert_eq!(rt.enable(), Err(ScxError::AlreadyEnabled));
        rt.disable().unwrap();
        assert_eq!(rt.exit_info().map(|i| i.kind), Some(ExitKind::Unreg));
        assert_eq!(rt.disable(), Err(ScxError::NotEnabled));
    }

    #[test]
    fn test_direct_dispatch_to_idle_cpu() {
        let rt = runtime(2);
        rt.enable().unwrap();
        // Everything starts idle
        let p = rt.add_task(Task::new(10, "a", 2).with_cpu(1)).unwrap();
        assert_eq!(rt.wake_up(10, 0, WakeFlags::empty()), Ok(Some(1)));
        assert_eq!(p.scx().dsq_id, dsq_local_on(1));
        assert_eq!(p.slice(), SCX_SLICE_DFL);
        assert!(rt.take_kick(1).is_some());

        let picked = rt.pick_next_task(1).unwrap();
        assert!(TaskRef::ptr_eq(&picked, &p));
        assert_eq!(p.state(), TaskState::Running);
        assert!(!rt.idle().is_idle(1));
    }

    #[test]
    fn test_dispatch_outside_allowed_callback_is_fatal() {
        let rt = runtime(2);
        rt.enable().unwrap();
        let p = rt.add_task(Task::new(1, "a", 2)).unwrap();
        rt.with_ctx(0, CallbackKind::Running, |ctx| ctx.dispatch(&p, SCX_DSQ_GLOBAL, 0, EnqFlags::empty()));
        let info = rt.exit_info().unwrap();
        assert_eq!(info.kind, ExitKind::Error);
        assert!(info.msg.contains("ops.running()"));
        // Teardown happens at the next entry point
        assert!(rt.is_enabled());
        assert!(rt.pick_next_task(0).is_none());
        assert!(!rt.is_enabled());
    }

    #[test]
    fn test_dispatch_cancel_and_slots() {
        let rt = runtime(1);
        rt.enable().unwrap();
        let p = rt.add_task(Task::new(1, "a", 1)).unwrap();
        p.scx().flags.insert(TaskFlags::RUNNABLE);
        rt.with_ctx(0, CallbackKind::Dispatch, |ctx| {
            assert_eq!(ctx.dispatch_nr_slots(), 32);
            ctx.dispatch(&p, SCX_DSQ_GLOBAL, 0, EnqFlags::empty());
            assert_eq!(ctx.dispatch_nr_slots(), 31);
            ctx.dispatch_cancel();
            assert_eq!(ctx.dispatch_nr_slots(), 32);
        });
        assert_eq!(p.state(), TaskState::NotQueued);
        assert_eq!(rt.global_dsq().nr_queued(), 0);
        assert!(rt.exit_info().is_none());
    }

    #[test]
    fn test_slice_expiry_on_tick() {
        let rt = runtime(1);
        rt.enable().unwrap();
        rt.add_task(Task::new(1, "a", 1)).unwrap();
        rt.enqueue_task(1, EnqFlags::empty()).unwrap();
        let p = rt.pick_next_task(0).unwrap();
        assert!(!rt.tick(0, SCX_SLICE_DFL / 2));
        assert!(rt.tick(0, SCX_SLICE_DFL));
        assert_eq!(p.slice(), 0);
        // No slice left: back through ops.enqueue() to the global DSQ
        rt.put_prev_task(0, true);
        assert_eq!(p.scx().dsq_id, SCX_DSQ_GLOBAL);
        assert_eq!(p.slice(), SCX_SLICE_DFL);
    }
}
