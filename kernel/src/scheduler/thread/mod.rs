//! Host-owned task and cgroup objects

pub mod cgroup;
pub mod state;
pub mod task;

pub use cgroup::{Cgroup, CgroupId};
pub use state::{TaskFlags, TaskState};
pub use task::{Pid, Task, TaskRef, TaskScx, WEIGHT_DFL};
