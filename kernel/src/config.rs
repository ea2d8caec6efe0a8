//! Runtime configuration
//!
//! ```ignore
//! let config = ScxConfig::new().with_nr_cpus(16).with_smt_threads(2);
//! config.validate()?;
//! ```

use crate::scheduler::core::cpumask::MAX_CPUS;
use crate::scheduler::core::error::{Result, ScxError};
use crate::scheduler::core::policy::SCX_SLICE_DFL;

/// sched_ext runtime parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScxConfig {
    /// Possible CPUs
    pub nr_cpus: u32,
    /// Hardware threads per core, siblings have contiguous ids
    pub smt_threads: u32,
    /// Limit on user-created DSQs
    pub max_user_dsqs: usize,
    /// Dispatch buffer slots available to `ops.dispatch()`
    pub dispatch_max_batch: u32,
    /// Slice given to tasks dispatched without one (ns)
    pub slice_dfl_ns: u64,
    /// Bytes of exit message kept
    pub exit_msg_len: usize,
}

impl ScxConfig {
    pub const fn new() -> Self {
        Self {
            nr_cpus: 8,
            smt_threads: 2,
            max_user_dsqs: 1024,
            dispatch_max_batch: 32,
            slice_dfl_ns: SCX_SLICE_DFL,
            exit_msg_len: 1024,
        }
    }

    pub const fn with_nr_cpus(mut self, nr_cpus: u32) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub const fn with_smt_threads(mut self, smt_threads: u32) -> Self {
        self.smt_threads = smt_threads;
        self
    }

    pub const fn with_max_user_dsqs(mut self, max: usize) -> Self {
        self.max_user_dsqs = max;
        self
    }

    pub const fn with_dispatch_max_batch(mut self, batch: u32) -> Self {
        self.dispatch_max_batch = batch;
        self
    }

    pub const fn with_slice_dfl_ns(mut self, slice: u64) -> Self {
        self.slice_dfl_ns = slice;
        self
    }

    pub const fn with_exit_msg_len(mut self, len: usize) -> Self {
        self.exit_msg_len = len;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0 || self.nr_cpus as usize > MAX_CPUS {
            return Err(ScxError::InvalidConfig { field: "nr_cpus", value: self.nr_cpus as u64 });
        }
        if self.smt_threads == 0 || self.nr_cpus % self.smt_threads != 0 {
            return Err(ScxError::InvalidConfig {
                field: "smt_threads",
                value: self.smt_threads as u64,
            });
        }
        if self.dispatch_max_batch == 0 {
            return Err(ScxError::InvalidConfig { field: "dispatch_max_batch", value: 0 });
        }
        if self.slice_dfl_ns == 0 {
            return Err(ScxError::InvalidConfig { field: "slice_dfl_ns", value: 0 });
        }
        Ok(())
    }
}

impl Default for ScxConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let c = ScxConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.slice_dfl_ns, 20_000_000);
        assert_eq!(c.max_user_dsqs, 1024);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_eq!(
            ScxConfig::new().with_nr_cpus(0).validate(),
            Err(ScxError::InvalidConfig { field: "nr_cpus", value: 0 })
        );
        assert!(ScxConfig::new().with_nr_cpus(513).validate().is_err());
        assert!(ScxConfig::new().with_nr_cpus(6).with_smt_threads(4).validate().is_err());
        assert!(ScxConfig::new().with_dispatch_max_batch(0).validate().is_err());
        assert!(ScxConfig::new().with_nr_cpus(512).with_smt_threads(1).validate().is_ok());
    }
}
