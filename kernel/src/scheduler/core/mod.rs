//! sched_ext core
//!
//! - `dsq`: dispatch queues and the user DSQ table
//! - `scheduler`: the runtime and the callback context
//! - `policy`: the [`SchedOps`] callback surface and DSQ/flag constants
//! - `exit`: first-exit-wins error and exit reporting
//! - `kref`: refcounted handles and object tables
//! - `cpumask`, `topology`, `collections`: building blocks

pub mod collections;
pub mod cpumask;
pub mod dsq;
pub mod error;
pub mod exit;
pub mod kref;
pub mod policy;
pub mod scheduler;
pub mod statistics;
pub mod topology;

pub use cpumask::{AtomicCpuMask, CpuMask, MAX_CPUS};
pub use dsq::{Dsq, DsqEntry, DsqTable};
pub use error::{Result, ScxError};
pub use exit::{ExitInfo, ExitKind, ExitSink};
pub use kref::{Handle, KptrSlot, ObjectTable};
pub use policy::{
    dsq_local_on, CallbackKind, DeqFlags, EnqFlags, KickFlags, SchedOps, SCX_DSQ_GLOBAL,
    SCX_DSQ_INVALID, SCX_DSQ_LOCAL, SCX_DSQ_LOCAL_ON, SCX_SLICE_DFL, SCX_SLICE_INF,
};
pub use scheduler::{ScxCpu, ScxCtx, ScxRuntime};
pub use statistics::{ScxStat, StatsSnapshot};
pub use topology::Topology;
