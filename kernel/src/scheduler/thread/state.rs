//! State - task dispatch state machine
//!
//! ```text
//! NotQueued ──dispatch──> Queued(dsq) ──consume──> Running
//!     ^                     │  │                      │
//!     └────dequeue/cancel───┘  └─dispatch─> Queued(other)
//!     └─────────────────────stopping──────────────────┘
//! ```

use bitflags::bitflags;
use core::fmt;

/// Where a task stands with respect to dispatch queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Not on any DSQ and not running
    NotQueued = 0,

    /// On exactly one DSQ
    Queued = 1,

    /// Consumed and executing on a CPU
    Running = 2,
}

impl TaskState {
    /// Can be moved by consume
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotQueued => write!(f, "not-queued"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Validate a dispatch state transition
pub fn validate_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;

    match (from, to) {
        // dispatch
        (NotQueued, Queued) => true,

        // re-dispatch to another DSQ
        (Queued, Queued) => true,

        // consume
        (Queued, Running) => true,

        // dequeue or dispatch_cancel
        (Queued, NotQueued) => true,

        // stopping, sleep
        (Running, NotQueued) => true,

        _ => false,
    }
}

bitflags! {
    /// Per-task scheduler flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Between enqueue and dequeue as far as the host is concerned
        const RUNNABLE = 1 << 1;
        /// `ops.enable()` ran for this task
        const ENABLED = 1 << 2;
        /// Last dequeue was because the task went to sleep
        const DEQD_FOR_SLEEP = 1 << 3;
    }
}
