//! sched_ext Error Handling
//!
//! Recoverable error types returned by the sched_ext primitives.
//!
//! Only resource conflicts travel through `Result`. Bounds violations are
//! `None`, racy misses are `None`/`false`, and invariant violations go through
//! the exit channel (see [`super::exit`]) and tear the scheduler down.

use core::fmt;

/// Standard result type for sched_ext operations
pub type Result<T> = core::result::Result<T, ScxError>;

/// Errno values used on the host-facing integer contract
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const E2BIG: i32 = 7;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

/// sched_ext error types with context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScxError {
    // ═══════════════════════════════════════════════════════════════
    // Dispatch Queue Errors
    // ═══════════════════════════════════════════════════════════════

    /// A DSQ with this id already exists
    DsqExists { dsq_id: u64 },

    /// No DSQ with this id
    DsqNotFound { dsq_id: u64 },

    /// Id carries the built-in flag and can't be created or destroyed
    DsqBuiltin { dsq_id: u64 },

    /// User DSQ limit reached
    DsqLimit { current: usize, max: usize },

    // ═══════════════════════════════════════════════════════════════
    // Object Errors
    // ═══════════════════════════════════════════════════════════════

    /// Task with this pid already registered
    TaskExists { pid: i32 },

    /// No live task with this pid
    TaskNotFound { pid: i32 },

    /// Cgroup with this id already registered
    CgroupExists { cgid: u64 },

    /// No live cgroup with this id
    CgroupNotFound { cgid: u64 },

    /// CPU id outside of the configured range
    InvalidCpu { cpu: u32, nr_cpus: u32 },

    /// Malformed cpumask string
    InvalidCpumask { reason: &'static str },

    // ═══════════════════════════════════════════════════════════════
    // Lifecycle Errors
    // ═══════════════════════════════════════════════════════════════

    /// A scheduler is already attached
    AlreadyEnabled,

    /// No scheduler attached
    NotEnabled,

    /// Setup-only operation attempted after enable
    Busy { operation: &'static str },

    /// Invalid configuration value
    InvalidConfig { field: &'static str, value: u64 },

    /// Policy init callback failed with this errno
    InitFailed { errno: i32 },

    /// Logger already installed
    LoggerAlreadySet,
}

impl ScxError {
    /// Negative errno for the host-facing integer contract
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::DsqExists { .. } | Self::TaskExists { .. } | Self::CgroupExists { .. } => {
                errno::EEXIST
            }
            Self::DsqNotFound { .. }
            | Self::TaskNotFound { .. }
            | Self::CgroupNotFound { .. }
            | Self::NotEnabled => errno::ENOENT,
            Self::DsqLimit { .. } => errno::E2BIG,
            Self::AlreadyEnabled | Self::Busy { .. } | Self::LoggerAlreadySet => errno::EBUSY,
            Self::InitFailed { errno } => return -errno.abs(),
            Self::DsqBuiltin { .. }
            | Self::InvalidCpu { .. }
            | Self::InvalidCpumask { .. }
            | Self::InvalidConfig { .. } => errno::EINVAL,
        };
        -code
    }
}

impl fmt::Display for ScxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DsqExists { dsq_id } => write!(f, "DSQ 0x{:x} already exists", dsq_id),
            Self::DsqNotFound { dsq_id } => write!(f, "DSQ 0x{:x} not found", dsq_id),
            Self::DsqBuiltin { dsq_id } => write!(f, "DSQ 0x{:x} is built-in", dsq_id),
            Self::DsqLimit { current, max } => {
                write!(f, "user DSQ limit reached: {}/{}", current, max)
            }
            Self::TaskExists { pid } => write!(f, "task {} already registered", pid),
            Self::TaskNotFound { pid } => write!(f, "task {} not found", pid),
            Self::CgroupExists { cgid } => write!(f, "cgroup {} already registered", cgid),
            Self::CgroupNotFound { cgid } => write!(f, "cgroup {} not found", cgid),
            Self::InvalidCpu { cpu, nr_cpus } => {
                write!(f, "invalid CPU {} (nr_cpus {})", cpu, nr_cpus)
            }
            Self::InvalidCpumask { reason } => write!(f, "invalid cpumask: {}", reason),
            Self::AlreadyEnabled => write!(f, "a scheduler is already enabled"),
            Self::NotEnabled => write!(f, "no scheduler enabled"),
            Self::Busy { operation } => write!(f, "{} not allowed while enabled", operation),
            Self::InvalidConfig { field, value } => {
                write!(f, "invalid config {} = {}", field, value)
            }
            Self::InitFailed { errno } => write!(f, "ops.init() failed ({})", errno),
            Self::LoggerAlreadySet => write!(f, "logger already set"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ScxError::DsqExists { dsq_id: 5 }.errno(), -errno::EEXIST);
        assert_eq!(ScxError::DsqLimit { current: 4, max: 4 }.errno(), -errno::E2BIG);
        assert_eq!(ScxError::InitFailed { errno: -12 }.errno(), -12);
        assert_eq!(ScxError::InitFailed { errno: 12 }.errno(), -12);
    }

    #[test]
    fn test_display() {
        let s = alloc::format!("{}", ScxError::DsqNotFound { dsq_id: 0x10 });
        assert_eq!(s, "DSQ 0x10 not found");
    }
}
